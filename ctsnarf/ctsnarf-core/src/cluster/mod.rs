//! Cluster registry: job lifecycle, worker presence, and the shard
//! coordinator that backs both.
//!
//! Jobs and workers are plain JSON records in the coordination KV.
//! Worker presence rides on a heartbeat lease, so a silent worker
//! simply vanishes from the registry when its lease runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::ctlog::CtLogClient;
use crate::error::{Error, Result};
use crate::kv::{Cmp, KeyPath, Kv, LeaseId, Op, Txn};

pub mod scheduler;
pub mod types;

pub use scheduler::{AcquiredShard, Coordinator, DEFAULT_LEASE_TTL};
pub use types::{
    ChunkInfo, JobInfo, JobSpec, JobState, JobStateRecord, OutputOptions, ShardAssignment,
    ShardManifest, ShardRange, ShardStatus, WorkerInfo, DEFAULT_SHARD_SIZE, SPEC_VERSION,
};

/// Heartbeat lease TTL for worker registrations.
pub const WORKER_TTL: Duration = Duration::from_secs(15);

/// Handle returned by worker registration; the lease is what keeps the
/// registration alive.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub lease_id: LeaseId,
}

pub struct Registry {
    kv: Arc<dyn Kv>,
    prefix: String,
    coordinator: Coordinator,
}

impl Registry {
    pub fn new(kv: Arc<dyn Kv>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let coordinator = Coordinator::new(kv.clone(), prefix.clone());
        Self {
            kv,
            prefix,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn kv(&self) -> &Arc<dyn Kv> {
        &self.kv
    }

    fn key(&self, path: KeyPath<'_>) -> String {
        path.resolve(&self.prefix)
    }

    /// Validate and persist a job, create its shard table, and move it
    /// to `Running`. An unset range end is resolved against the log's
    /// signed tree head at submission and persisted, so the shard table
    /// is always built from a fixed range.
    pub async fn submit_job(&self, mut spec: JobSpec) -> Result<String> {
        spec.validate()?;
        let end = match spec.end {
            Some(end) => end,
            None => {
                let size = CtLogClient::new(&spec.log_uri)?.tree_size().await?;
                if size <= spec.start {
                    return Err(Error::validation(format!(
                        "log has {size} leaves, nothing at or after index {}",
                        spec.start
                    )));
                }
                spec.end = Some(size);
                size
            }
        };
        let range = ShardRange::new(spec.start, end)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let state = JobStateRecord {
            state: JobState::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let spec_key = self.key(KeyPath::JobSpec(&job_id));
        let txn = Txn::new()
            .when(Cmp::VersionEq(spec_key.clone(), 0))
            .then(Op::Put {
                key: spec_key,
                value: serde_json::to_vec(&spec)?,
                lease: None,
            })
            .then(Op::Put {
                key: self.key(KeyPath::JobState(&job_id)),
                value: serde_json::to_vec(&state)?,
                lease: None,
            });
        if !self.kv.txn(txn).await? {
            return Err(Error::conflict(format!("job {job_id} already exists")));
        }

        let shard_size = spec.effective_shard_size(range.len());
        let shards = self
            .coordinator
            .create_shards(&job_id, range, shard_size)
            .await?;
        if shards > 0 {
            self.mark_job_started(&job_id).await?;
        }
        info!(job_id, range = %range, shards, "submitted job");
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobInfo> {
        let spec = self
            .kv
            .get(&self.key(KeyPath::JobSpec(job_id)))
            .await?
            .ok_or_else(|| Error::not_found(format!("job {job_id}")))?;
        let state = self
            .kv
            .get(&self.key(KeyPath::JobState(job_id)))
            .await?
            .ok_or_else(|| Error::not_found(format!("job {job_id} state")))?;
        Ok(JobInfo {
            id: job_id.to_string(),
            spec: serde_json::from_slice(&spec.value)?,
            state: serde_json::from_slice(&state.value)?,
        })
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let root = self.key(KeyPath::JobsPrefix);
        let kvs = self.kv.range(&root, false).await?;

        let mut specs = std::collections::BTreeMap::new();
        let mut states = std::collections::BTreeMap::new();
        for kv in kvs {
            let Some(rest) = kv.key.strip_prefix(&root) else {
                continue;
            };
            let Some((job_id, tail)) = rest.split_once('/') else {
                continue;
            };
            match tail {
                "spec" => {
                    specs.insert(job_id.to_string(), kv.value);
                }
                "state" => {
                    states.insert(job_id.to_string(), kv.value);
                }
                _ => {}
            }
        }

        let mut jobs = Vec::with_capacity(specs.len());
        for (job_id, spec) in specs {
            let Some(state) = states.get(&job_id) else {
                continue;
            };
            jobs.push(JobInfo {
                id: job_id,
                spec: serde_json::from_slice(&spec)?,
                state: serde_json::from_slice(state)?,
            });
        }
        Ok(jobs)
    }

    pub async fn mark_job_started(&self, job_id: &str) -> Result<()> {
        self.update_state(job_id, |record| {
            if record.state == JobState::Pending {
                record.state = JobState::Running;
                record.started_at.get_or_insert_with(Utc::now);
            }
        })
        .await
    }

    /// Transition to `Completed`. Asserts that every shard is done;
    /// concurrent callers are idempotent.
    pub async fn mark_job_completed(&self, job_id: &str) -> Result<()> {
        if !self.coordinator.job_complete(job_id).await? {
            return Err(Error::conflict(format!(
                "job {job_id} still has unfinished shards"
            )));
        }
        self.update_state(job_id, |record| {
            if record.state == JobState::Running {
                record.state = JobState::Completed;
                record.completed_at.get_or_insert_with(Utc::now);
            }
        })
        .await
    }

    pub async fn update_job_state(&self, job_id: &str, state: JobState) -> Result<()> {
        self.update_state(job_id, |record| record.state = state).await
    }

    /// Set the cancellation flag and transition the job in one
    /// transaction. Workers observe the flag and stop acquiring shards.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        for _ in 0..3 {
            let state_key = self.key(KeyPath::JobState(job_id));
            let current = self
                .kv
                .get(&state_key)
                .await?
                .ok_or_else(|| Error::not_found(format!("job {job_id}")))?;
            let mut record: JobStateRecord = serde_json::from_slice(&current.value)?;
            if record.state == JobState::Cancelled {
                return Ok(());
            }
            record.state = JobState::Cancelled;
            record.completed_at.get_or_insert_with(Utc::now);

            let txn = Txn::new()
                .when(Cmp::VersionEq(state_key.clone(), current.version))
                .then(Op::Put {
                    key: self.key(KeyPath::JobCancel(job_id)),
                    value: b"1".to_vec(),
                    lease: None,
                })
                .then(Op::Put {
                    key: state_key,
                    value: serde_json::to_vec(&record)?,
                    lease: None,
                });
            if self.kv.txn(txn).await? {
                info!(job_id, "cancelled job");
                return Ok(());
            }
        }
        Err(Error::conflict(format!(
            "job {job_id} state changed repeatedly during cancel"
        )))
    }

    pub async fn is_job_cancelled(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .kv
            .get(&self.key(KeyPath::JobCancel(job_id)))
            .await?
            .is_some())
    }

    /// Register a worker under a fresh heartbeat lease.
    pub async fn register_worker(&self, worker_id: &str, host: &str) -> Result<WorkerHandle> {
        let lease_id = self.kv.grant_lease(WORKER_TTL.as_secs() as i64).await?;
        let now = Utc::now();
        let info = WorkerInfo {
            id: worker_id.to_string(),
            host: host.to_string(),
            started_at: now,
            last_heartbeat: now,
        };
        self.kv
            .put(
                &self.key(KeyPath::Worker(worker_id)),
                serde_json::to_vec(&info)?,
                Some(lease_id),
            )
            .await?;
        info!(worker_id, host, "registered worker");
        Ok(WorkerHandle {
            worker_id: worker_id.to_string(),
            lease_id,
        })
    }

    /// Renew a worker's heartbeat lease and refresh its record.
    /// Returns `LeaseLost` when the lease has already expired, in which
    /// case the worker must re-register.
    pub async fn heartbeat_worker(&self, handle: &WorkerHandle) -> Result<()> {
        self.kv.keep_alive(handle.lease_id).await?;

        let key = self.key(KeyPath::Worker(&handle.worker_id));
        if let Some(kv) = self.kv.get(&key).await? {
            let mut info: WorkerInfo = serde_json::from_slice(&kv.value)?;
            info.last_heartbeat = Utc::now();
            self.kv
                .put(&key, serde_json::to_vec(&info)?, Some(handle.lease_id))
                .await?;
        } else {
            warn!(worker_id = %handle.worker_id, "worker record missing during heartbeat");
        }
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let kvs = self
            .kv
            .range(&self.key(KeyPath::WorkersPrefix), false)
            .await?;
        kvs.into_iter()
            .map(|kv| serde_json::from_slice(&kv.value).map_err(Into::into))
            .collect()
    }

    async fn update_state(
        &self,
        job_id: &str,
        mutate: impl Fn(&mut JobStateRecord),
    ) -> Result<()> {
        for _ in 0..3 {
            let state_key = self.key(KeyPath::JobState(job_id));
            let current = self
                .kv
                .get(&state_key)
                .await?
                .ok_or_else(|| Error::not_found(format!("job {job_id}")))?;
            let mut record: JobStateRecord = serde_json::from_slice(&current.value)?;
            mutate(&mut record);

            let txn = Txn::new()
                .when(Cmp::VersionEq(state_key.clone(), current.version))
                .then(Op::Put {
                    key: state_key,
                    value: serde_json::to_vec(&record)?,
                    lease: None,
                });
            if self.kv.txn(txn).await? {
                return Ok(());
            }
        }
        Err(Error::conflict(format!(
            "job {job_id} state changed repeatedly"
        )))
    }
}
