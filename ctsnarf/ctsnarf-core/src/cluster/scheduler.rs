//! Shard coordinator: splitting jobs into shards, handing them out
//! under expiring leases, reassigning orphans, and recording completion.
//!
//! All mutations of shard records go through version-compare
//! transactions so that the KV's serializability — not wall clocks or
//! goodwill — arbitrates races between workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::cluster::types::{ShardAssignment, ShardManifest, ShardRange, ShardStatus};
use crate::error::{Error, Result};
use crate::kv::{Cmp, KeyPath, Kv, LeaseId, Op, Txn};

/// Default TTL for shard assignment leases.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// A shard successfully leased to a worker.
#[derive(Debug, Clone)]
pub struct AcquiredShard {
    pub job_id: String,
    pub shard_id: u64,
    pub range: ShardRange,
    pub lease_id: LeaseId,
}

pub struct Coordinator {
    kv: Arc<dyn Kv>,
    prefix: String,
}

impl Coordinator {
    pub fn new(kv: Arc<dyn Kv>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }

    fn key(&self, path: KeyPath<'_>) -> String {
        path.resolve(&self.prefix)
    }

    /// Split `range` into shards of at most `shard_size` leaves and
    /// create all range and status records in one transaction.
    ///
    /// Idempotent: retries against an already-sharded job succeed
    /// without touching anything.
    pub async fn create_shards(
        &self,
        job_id: &str,
        range: ShardRange,
        shard_size: u64,
    ) -> Result<u64> {
        let shard_size = shard_size.max(1);
        let count = range.len().div_ceil(shard_size);

        let mut txn = Txn::new().when(Cmp::VersionEq(self.key(KeyPath::ShardRange(job_id, 0)), 0));
        for i in 0..count {
            let lo = range.lo + i * shard_size;
            let hi = (lo + shard_size).min(range.hi);
            let shard_range = ShardRange { lo, hi };
            txn = txn
                .then(Op::Put {
                    key: self.key(KeyPath::ShardRange(job_id, i)),
                    value: serde_json::to_vec(&shard_range)?,
                    lease: None,
                })
                .then(Op::Put {
                    key: self.key(KeyPath::ShardStatus(job_id, i)),
                    value: serde_json::to_vec(&ShardStatus::fresh(shard_range))?,
                    lease: None,
                });
        }

        if self.kv.txn(txn).await? {
            info!(job_id, shards = count, "created shard table");
        } else {
            debug!(job_id, "shard table already exists");
        }
        Ok(count)
    }

    /// Try to lease one open shard of `job_id` to `worker_id`.
    ///
    /// Scans candidate shards in random order and attempts a single
    /// transaction per candidate: the shard must be unassigned, its
    /// status unchanged since our read, and the job not cancelled. The
    /// first transaction to commit wins; `None` means every candidate
    /// was taken (or the job has no open shards), and the caller should
    /// back off.
    pub async fn try_acquire_shard(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<AcquiredShard>> {
        let mut candidates = self.open_shards(job_id).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.shuffle(&mut rand::thread_rng());

        let cancel_key = self.key(KeyPath::JobCancel(job_id));
        for (shard_id, status, status_version) in candidates {
            let lease_id = self.kv.grant_lease(lease_ttl.as_secs() as i64).await?;
            let now = Utc::now();
            let assignment = ShardAssignment {
                job_id: job_id.to_string(),
                shard_id,
                worker_id: worker_id.to_string(),
                lease_id,
                lease_expiry: now
                    + chrono::Duration::from_std(lease_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                acquired_at: now,
            };
            let mut claimed = status.clone();
            claimed.last_assignee = Some(worker_id.to_string());

            let assign_key = self.key(KeyPath::ShardAssignment(job_id, shard_id));
            let status_key = self.key(KeyPath::ShardStatus(job_id, shard_id));
            let txn = Txn::new()
                .when(Cmp::VersionEq(assign_key.clone(), 0))
                .when(Cmp::VersionEq(status_key.clone(), status_version))
                .when(Cmp::VersionEq(cancel_key.clone(), 0))
                .then(Op::Put {
                    key: assign_key,
                    value: serde_json::to_vec(&assignment)?,
                    lease: Some(lease_id),
                })
                .then(Op::Put {
                    key: status_key,
                    value: serde_json::to_vec(&claimed)?,
                    lease: None,
                });

            if self.kv.txn(txn).await? {
                debug!(job_id, shard_id, worker_id, "acquired shard");
                return Ok(Some(AcquiredShard {
                    job_id: job_id.to_string(),
                    shard_id,
                    range: status.range,
                    lease_id,
                }));
            }
            // Lost the race; don't leak the lease.
            let _ = self.kv.revoke_lease(lease_id).await;
        }
        Ok(None)
    }

    /// Renew the assignment lease and refresh the advisory expiry
    /// stored in the assignment record.
    pub async fn renew(&self, acq: &AcquiredShard, lease_ttl: Duration) -> Result<()> {
        self.kv.keep_alive(acq.lease_id).await?;

        let assign_key = self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id));
        if let Some(kv) = self.kv.get(&assign_key).await? {
            let mut assignment: ShardAssignment = serde_json::from_slice(&kv.value)?;
            if assignment.lease_id != acq.lease_id {
                return Err(Error::lease_lost("assignment re-leased to another worker"));
            }
            assignment.lease_expiry = Utc::now()
                + chrono::Duration::from_std(lease_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.kv
                .put(
                    &assign_key,
                    serde_json::to_vec(&assignment)?,
                    Some(acq.lease_id),
                )
                .await?;
        }
        Ok(())
    }

    /// Shards whose status is open but which have no live assignment.
    pub async fn find_orphaned_shards(&self, job_id: &str) -> Result<Vec<u64>> {
        let prefix = self.key(KeyPath::JobShardsPrefix(job_id));
        let kvs = self.kv.range(&prefix, false).await?;

        let mut open = Vec::new();
        let mut assigned = std::collections::HashSet::new();
        for kv in kvs {
            if kv.key.ends_with("/status") {
                let status: ShardStatus = serde_json::from_slice(&kv.value)?;
                if status.is_open() {
                    if let Some(id) = crate::kv::shard_id_from_key(&kv.key) {
                        open.push(id);
                    }
                }
            } else if kv.key.ends_with("/assignment") {
                if let Some(id) = crate::kv::shard_id_from_key(&kv.key) {
                    assigned.insert(id);
                }
            }
        }
        open.retain(|id| !assigned.contains(id));
        Ok(open)
    }

    /// Pick up orphaned shards by re-running the acquisition protocol.
    /// Assignments backed by a live lease are never stolen; acquisition
    /// only commits where no assignment key exists at all.
    pub async fn reassign_orphaned_shards(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<AcquiredShard>> {
        self.try_acquire_shard(job_id, worker_id, lease_ttl).await
    }

    /// Replace a held shard with a set of smaller shards.
    ///
    /// The new ranges must be non-empty, disjoint, and exactly cover
    /// the old shard's range. The old shard's records vanish and fresh
    /// dense IDs continue from the current maximum; the caller's
    /// assignment is consumed, so it must re-enter acquisition.
    pub async fn request_shard_split(
        &self,
        acq: &AcquiredShard,
        new_ranges: &[ShardRange],
    ) -> Result<Vec<u64>> {
        let (status, status_version) = self.read_status(&acq.job_id, acq.shard_id).await?;
        if status.done {
            return Err(Error::conflict("shard already completed"));
        }
        validate_split(status.range, new_ranges)?;

        let (_, assign_version) = self.read_owned_assignment(acq).await?;
        let next_id = self.max_shard_id(&acq.job_id).await? + 1;

        let mut txn = Txn::new()
            .when(Cmp::VersionEq(
                self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id)),
                assign_version,
            ))
            .when(Cmp::VersionEq(
                self.key(KeyPath::ShardStatus(&acq.job_id, acq.shard_id)),
                status_version,
            ))
            .then(Op::Delete {
                key: self.key(KeyPath::ShardRange(&acq.job_id, acq.shard_id)),
            })
            .then(Op::Delete {
                key: self.key(KeyPath::ShardStatus(&acq.job_id, acq.shard_id)),
            })
            .then(Op::Delete {
                key: self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id)),
            })
            .then(Op::Delete {
                key: self.key(KeyPath::ShardManifest(&acq.job_id, acq.shard_id)),
            });

        let mut new_ids = Vec::with_capacity(new_ranges.len());
        for (offset, range) in new_ranges.iter().enumerate() {
            let id = next_id + offset as u64;
            new_ids.push(id);
            txn = txn
                .then(Op::Put {
                    key: self.key(KeyPath::ShardRange(&acq.job_id, id)),
                    value: serde_json::to_vec(range)?,
                    lease: None,
                })
                .then(Op::Put {
                    key: self.key(KeyPath::ShardStatus(&acq.job_id, id)),
                    value: serde_json::to_vec(&ShardStatus::fresh(*range))?,
                    lease: None,
                });
        }

        if !self.kv.txn(txn).await? {
            return Err(Error::conflict("shard changed during split"));
        }
        info!(
            job_id = %acq.job_id,
            shard_id = acq.shard_id,
            new = ?new_ids,
            "split shard"
        );
        Ok(new_ids)
    }

    /// Record a shard as done: write its manifest, mark the status, and
    /// release the assignment in one transaction.
    ///
    /// Idempotent: reporting an already-done shard is a no-op success.
    pub async fn report_shard_done(
        &self,
        acq: &AcquiredShard,
        manifest: &ShardManifest,
    ) -> Result<()> {
        let (status, status_version) = self.read_status(&acq.job_id, acq.shard_id).await?;
        if status.done {
            return Ok(());
        }
        let (_, assign_version) = self.read_owned_assignment(acq).await?;

        let mut done = status;
        done.done = true;
        let txn = Txn::new()
            .when(Cmp::VersionEq(
                self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id)),
                assign_version,
            ))
            .when(Cmp::VersionEq(
                self.key(KeyPath::ShardStatus(&acq.job_id, acq.shard_id)),
                status_version,
            ))
            .then(Op::Put {
                key: self.key(KeyPath::ShardManifest(&acq.job_id, acq.shard_id)),
                value: serde_json::to_vec(manifest)?,
                lease: None,
            })
            .then(Op::Put {
                key: self.key(KeyPath::ShardStatus(&acq.job_id, acq.shard_id)),
                value: serde_json::to_vec(&done)?,
                lease: None,
            })
            .then(Op::Delete {
                key: self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id)),
            });

        if self.kv.txn(txn).await? {
            info!(job_id = %acq.job_id, shard_id = acq.shard_id, records = manifest.records, "shard done");
            return Ok(());
        }
        // Lost the race; if someone else (a previous attempt of ours)
        // already marked it done, that is still success.
        let (status, _) = self.read_status(&acq.job_id, acq.shard_id).await?;
        if status.done {
            return Ok(());
        }
        Err(Error::conflict("shard changed while reporting completion"))
    }

    /// Park a shard as failed and release the assignment. Failed shards
    /// are not retried automatically; an operator clears the flag or
    /// splits the shard.
    pub async fn report_shard_failed(&self, acq: &AcquiredShard, error: &str) -> Result<()> {
        let (status, status_version) = self.read_status(&acq.job_id, acq.shard_id).await?;
        if status.done {
            return Err(Error::conflict("shard already completed"));
        }
        let (_, assign_version) = self.read_owned_assignment(acq).await?;

        let mut failed = status;
        failed.failed = true;
        failed.last_error = Some(error.to_string());
        let txn = Txn::new()
            .when(Cmp::VersionEq(
                self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id)),
                assign_version,
            ))
            .when(Cmp::VersionEq(
                self.key(KeyPath::ShardStatus(&acq.job_id, acq.shard_id)),
                status_version,
            ))
            .then(Op::Put {
                key: self.key(KeyPath::ShardStatus(&acq.job_id, acq.shard_id)),
                value: serde_json::to_vec(&failed)?,
                lease: None,
            })
            .then(Op::Delete {
                key: self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id)),
            });

        if !self.kv.txn(txn).await? {
            return Err(Error::conflict("shard changed while reporting failure"));
        }
        warn!(job_id = %acq.job_id, shard_id = acq.shard_id, error, "shard failed");
        Ok(())
    }

    /// Whether every shard of the job is done.
    pub async fn job_complete(&self, job_id: &str) -> Result<bool> {
        let statuses = self.shard_statuses(job_id).await?;
        Ok(!statuses.is_empty() && statuses.values().all(|s| s.done))
    }

    /// All shard statuses of a job, keyed by shard ID.
    pub async fn shard_statuses(&self, job_id: &str) -> Result<BTreeMap<u64, ShardStatus>> {
        let prefix = self.key(KeyPath::JobShardsPrefix(job_id));
        let kvs = self.kv.range(&prefix, false).await?;
        let mut out = BTreeMap::new();
        for kv in kvs {
            if !kv.key.ends_with("/status") {
                continue;
            }
            if let Some(id) = crate::kv::shard_id_from_key(&kv.key) {
                out.insert(id, serde_json::from_slice(&kv.value)?);
            }
        }
        Ok(out)
    }

    pub async fn get_manifest(&self, job_id: &str, shard_id: u64) -> Result<Option<ShardManifest>> {
        let key = self.key(KeyPath::ShardManifest(job_id, shard_id));
        match self.kv.get(&key).await? {
            Some(kv) => Ok(Some(serde_json::from_slice(&kv.value)?)),
            None => Ok(None),
        }
    }

    async fn open_shards(&self, job_id: &str) -> Result<Vec<(u64, ShardStatus, i64)>> {
        let prefix = self.key(KeyPath::JobShardsPrefix(job_id));
        let kvs = self.kv.range(&prefix, false).await?;
        let mut out = Vec::new();
        for kv in kvs {
            if !kv.key.ends_with("/status") {
                continue;
            }
            let status: ShardStatus = serde_json::from_slice(&kv.value)?;
            if !status.is_open() {
                continue;
            }
            if let Some(id) = crate::kv::shard_id_from_key(&kv.key) {
                out.push((id, status, kv.version));
            }
        }
        Ok(out)
    }

    async fn read_status(&self, job_id: &str, shard_id: u64) -> Result<(ShardStatus, i64)> {
        let key = self.key(KeyPath::ShardStatus(job_id, shard_id));
        let kv = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found(format!("shard {job_id}/{shard_id}")))?;
        Ok((serde_json::from_slice(&kv.value)?, kv.version))
    }

    /// Read the assignment and verify the caller still owns it.
    async fn read_owned_assignment(&self, acq: &AcquiredShard) -> Result<(ShardAssignment, i64)> {
        let key = self.key(KeyPath::ShardAssignment(&acq.job_id, acq.shard_id));
        let kv = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::lease_lost("assignment expired"))?;
        let assignment: ShardAssignment = serde_json::from_slice(&kv.value)?;
        if assignment.lease_id != acq.lease_id {
            return Err(Error::lease_lost("assignment re-leased to another worker"));
        }
        Ok((assignment, kv.version))
    }

    async fn max_shard_id(&self, job_id: &str) -> Result<u64> {
        let prefix = self.key(KeyPath::JobShardsPrefix(job_id));
        let kvs = self.kv.range(&prefix, true).await?;
        Ok(kvs
            .iter()
            .filter(|kv| kv.key.ends_with("/range"))
            .filter_map(|kv| crate::kv::shard_id_from_key(&kv.key))
            .max()
            .unwrap_or(0))
    }
}

fn validate_split(old: ShardRange, new_ranges: &[ShardRange]) -> Result<()> {
    if new_ranges.is_empty() {
        return Err(Error::validation("split requires at least one range"));
    }
    let mut sorted = new_ranges.to_vec();
    sorted.sort_by_key(|r| r.lo);
    for r in &sorted {
        if r.is_empty() {
            return Err(Error::validation(format!("empty split range {r}")));
        }
    }
    if sorted.first().map(|r| r.lo) != Some(old.lo) || sorted.last().map(|r| r.hi) != Some(old.hi) {
        return Err(Error::validation(format!(
            "split ranges must cover {old} exactly"
        )));
    }
    for pair in sorted.windows(2) {
        if pair[0].hi != pair[1].lo {
            return Err(Error::validation(format!(
                "split ranges must be disjoint and contiguous, got {} then {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_validation() {
        let old = ShardRange { lo: 0, hi: 1000 };
        let ok = [
            ShardRange { lo: 0, hi: 500 },
            ShardRange { lo: 500, hi: 1000 },
        ];
        assert!(validate_split(old, &ok).is_ok());

        // Gap in the middle.
        let gap = [
            ShardRange { lo: 0, hi: 400 },
            ShardRange { lo: 500, hi: 1000 },
        ];
        assert!(validate_split(old, &gap).is_err());

        // Does not reach the end of the original range.
        let short = [ShardRange { lo: 0, hi: 999 }];
        assert!(validate_split(old, &short).is_err());

        assert!(validate_split(old, &[]).is_err());
    }
}
