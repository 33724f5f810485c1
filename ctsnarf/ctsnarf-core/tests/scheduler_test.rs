//! Integration tests for the shard coordination protocol against the
//! in-memory KV.

use std::sync::Arc;
use std::time::Duration;

use ctsnarf_core::cluster::{
    ChunkInfo, JobSpec, OutputOptions, Registry, ShardManifest, ShardRange, SPEC_VERSION,
};
use ctsnarf_core::kv::{Kv, MemoryKv};

const TTL: Duration = Duration::from_secs(60);

fn spec(start: u64, end: u64, shard_size: u64) -> JobSpec {
    JobSpec {
        version: SPEC_VERSION,
        log_uri: "https://ct.example.net/log".into(),
        start,
        end: Some(end),
        output: OutputOptions {
            extractor: "raw".into(),
            transformer: "jsonl".into(),
            sink: "null".into(),
            ..Default::default()
        },
        shard_size,
        shard_count: 0,
    }
}

fn manifest(shard_id: u64, range: ShardRange) -> ShardManifest {
    ShardManifest {
        shard_id,
        range,
        records: range.hi - range.lo,
        bytes: 10,
        chunks: vec![ChunkInfo {
            name: "chunk.0001".into(),
            bytes: 10,
            records: range.hi - range.lo,
            sha256: "00".repeat(32),
        }],
    }
}

fn cluster() -> (Arc<MemoryKv>, Registry) {
    let kv = Arc::new(MemoryKv::new());
    let registry = Registry::new(kv.clone() as Arc<dyn Kv>, "/test");
    (kv, registry)
}

#[tokio::test]
async fn shards_partition_the_job_range() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 1000, 300)).await.unwrap();

    let statuses = registry.coordinator().shard_statuses(&job_id).await.unwrap();
    assert_eq!(statuses.len(), 4);

    let mut ranges: Vec<ShardRange> = statuses.values().map(|s| s.range).collect();
    ranges.sort_by_key(|r| r.lo);
    assert_eq!(ranges.first().unwrap().lo, 0);
    assert_eq!(ranges.last().unwrap().hi, 1000);
    for pair in ranges.windows(2) {
        assert_eq!(pair[0].hi, pair[1].lo, "ranges must tile without gaps");
    }
    assert!(statuses.values().all(|s| s.is_open()));
}

#[tokio::test]
async fn shard_creation_is_idempotent() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 100, 40)).await.unwrap();

    let range = ShardRange::new(0, 100).unwrap();
    registry
        .coordinator()
        .create_shards(&job_id, range, 40)
        .await
        .unwrap();

    let statuses = registry.coordinator().shard_statuses(&job_id).await.unwrap();
    assert_eq!(statuses.len(), 3);
}

#[tokio::test]
async fn at_most_one_assignment_per_shard() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 10, 100)).await.unwrap();
    let coordinator = registry.coordinator();

    let first = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap();
    assert!(first.is_some());

    let second = coordinator
        .try_acquire_shard(&job_id, "w2", TTL)
        .await
        .unwrap();
    assert!(second.is_none(), "a held shard must not be double-assigned");
}

#[tokio::test]
async fn failover_to_second_worker_after_lease_expiry() {
    let (kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 10, 100)).await.unwrap();
    let coordinator = registry.coordinator();

    let w1 = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .unwrap();

    // W1 stops renewing; its lease expires and the assignment vanishes.
    kv.expire_lease(w1.lease_id);

    let orphans = coordinator.find_orphaned_shards(&job_id).await.unwrap();
    assert_eq!(orphans, vec![w1.shard_id]);

    let w2 = coordinator
        .reassign_orphaned_shards(&job_id, "w2", TTL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(w2.shard_id, w1.shard_id);

    coordinator
        .report_shard_done(&w2, &manifest(w2.shard_id, w2.range))
        .await
        .unwrap();

    let statuses = coordinator.shard_statuses(&job_id).await.unwrap();
    assert!(statuses[&w2.shard_id].done);
    assert!(coordinator
        .get_manifest(&job_id, w2.shard_id)
        .await
        .unwrap()
        .is_some());

    // The loser's stale attempt must not clobber anything: reporting an
    // already-done shard is a no-op success.
    coordinator
        .report_shard_done(&w1, &manifest(w1.shard_id, w1.range))
        .await
        .unwrap();

    registry.mark_job_completed(&job_id).await.unwrap();
    let job = registry.get_job(&job_id).await.unwrap();
    assert_eq!(job.state.state.to_string(), "completed");
}

#[tokio::test]
async fn split_replaces_shard_with_fresh_ids() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 1000, 1000)).await.unwrap();
    let coordinator = registry.coordinator();

    let acq = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acq.shard_id, 0);

    let halves = [
        ShardRange::new(0, 500).unwrap(),
        ShardRange::new(500, 1000).unwrap(),
    ];
    let new_ids = coordinator.request_shard_split(&acq, &halves).await.unwrap();
    assert_eq!(new_ids, vec![1, 2]);

    let statuses = coordinator.shard_statuses(&job_id).await.unwrap();
    assert!(!statuses.contains_key(&0), "old shard must be gone");
    assert_eq!(statuses.len(), 2);
    let mut ranges: Vec<ShardRange> = statuses.values().map(|s| s.range).collect();
    ranges.sort_by_key(|r| r.lo);
    assert_eq!(ranges[0], halves[0]);
    assert_eq!(ranges[1], halves[1]);
    assert!(statuses.values().all(|s| s.is_open()));
    assert!(coordinator
        .find_orphaned_shards(&job_id)
        .await
        .unwrap()
        .len()
        == 2);

    // The caller's assignment was consumed; it re-enters acquisition.
    let next = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .unwrap();
    assert!(new_ids.contains(&next.shard_id));
}

#[tokio::test]
async fn split_rejects_bad_partitions() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 100, 100)).await.unwrap();
    let coordinator = registry.coordinator();
    let acq = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .unwrap();

    let gap = [
        ShardRange::new(0, 40).unwrap(),
        ShardRange::new(60, 100).unwrap(),
    ];
    assert!(coordinator.request_shard_split(&acq, &gap).await.is_err());

    // The failed split must leave the original shard intact.
    let statuses = coordinator.shard_statuses(&job_id).await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[&0].range, ShardRange::new(0, 100).unwrap());
}

#[tokio::test]
async fn failed_shards_are_parked() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 10, 100)).await.unwrap();
    let coordinator = registry.coordinator();

    let acq = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .unwrap();
    coordinator
        .report_shard_failed(&acq, "sink exploded")
        .await
        .unwrap();

    let statuses = coordinator.shard_statuses(&job_id).await.unwrap();
    assert!(statuses[&acq.shard_id].failed);
    assert_eq!(
        statuses[&acq.shard_id].last_error.as_deref(),
        Some("sink exploded")
    );

    // Failed shards are not candidates for acquisition.
    assert!(coordinator
        .try_acquire_shard(&job_id, "w2", TTL)
        .await
        .unwrap()
        .is_none());
    assert!(!coordinator.job_complete(&job_id).await.unwrap());
}

#[tokio::test]
async fn cancellation_blocks_acquisition() {
    let (_kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 10, 100)).await.unwrap();

    registry.cancel_job(&job_id).await.unwrap();
    assert!(registry.is_job_cancelled(&job_id).await.unwrap());

    assert!(registry
        .coordinator()
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .is_none());

    // Cancelling again is harmless.
    registry.cancel_job(&job_id).await.unwrap();
}

#[tokio::test]
async fn stale_owner_cannot_report() {
    let (kv, registry) = cluster();
    let job_id = registry.submit_job(spec(0, 10, 100)).await.unwrap();
    let coordinator = registry.coordinator();

    let w1 = coordinator
        .try_acquire_shard(&job_id, "w1", TTL)
        .await
        .unwrap()
        .unwrap();
    kv.expire_lease(w1.lease_id);
    let _w2 = coordinator
        .try_acquire_shard(&job_id, "w2", TTL)
        .await
        .unwrap()
        .unwrap();

    // W1 is no longer the assignee; its failure report must bounce.
    let err = coordinator
        .report_shard_failed(&w1, "stale")
        .await
        .unwrap_err();
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn worker_registration_and_heartbeat() {
    let (kv, registry) = cluster();

    let handle = registry.register_worker("w1", "host-a").await.unwrap();
    assert_eq!(registry.list_workers().await.unwrap().len(), 1);

    registry.heartbeat_worker(&handle).await.unwrap();

    kv.expire_lease(handle.lease_id);
    assert!(registry.list_workers().await.unwrap().is_empty());
    assert!(registry
        .heartbeat_worker(&handle)
        .await
        .unwrap_err()
        .is_lease_lost());
}
