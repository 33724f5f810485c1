//! Durable job, shard, and worker records as persisted in the KV.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current job spec schema version.
pub const SPEC_VERSION: u32 = 1;

/// Default target shard size in leaves when the spec leaves it unset.
pub const DEFAULT_SHARD_SIZE: u64 = 100_000;

/// Output wiring for a job: which extractor, transformer, and sink to
/// run each leaf through, and how to bound output chunks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputOptions {
    pub extractor: String,
    pub transformer: String,
    #[serde(default)]
    pub transformer_options: BTreeMap<String, serde_json::Value>,
    pub sink: String,
    #[serde(default)]
    pub sink_options: BTreeMap<String, serde_json::Value>,
    /// gzip, bzip2, zstd, or empty for none.
    #[serde(default)]
    pub compression: String,
    /// Rotate the chunk once this many bytes of records are written.
    #[serde(default)]
    pub chunk_bytes: u64,
    /// Rotate the chunk once this many records are written.
    #[serde(default)]
    pub chunk_records: u64,
}

/// Immutable description of an ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub version: u32,
    /// Base URI of the CT log, e.g. `https://ct.example.net/2025`.
    pub log_uri: String,
    /// First leaf index to ingest.
    pub start: u64,
    /// One past the last leaf index. `None` means "the log's tree size
    /// at submission", resolved and persisted by the registry.
    pub end: Option<u64>,
    pub output: OutputOptions,
    /// Target shard size in leaves.
    #[serde(default)]
    pub shard_size: u64,
    /// Desired initial shard count; used to derive a shard size when
    /// `shard_size` is unset.
    #[serde(default)]
    pub shard_count: u64,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.log_uri.is_empty() {
            return Err(Error::validation("log_uri is required"));
        }
        if let Some(end) = self.end {
            if self.start >= end {
                return Err(Error::validation(format!(
                    "empty index range [{}, {})",
                    self.start, end
                )));
            }
        }
        if self.output.extractor.is_empty() {
            return Err(Error::validation("output.extractor is required"));
        }
        if self.output.transformer.is_empty() {
            return Err(Error::validation("output.transformer is required"));
        }
        if self.output.sink.is_empty() {
            return Err(Error::validation("output.sink is required"));
        }
        Ok(())
    }

    /// The shard size to split this job with.
    pub fn effective_shard_size(&self, total: u64) -> u64 {
        if self.shard_size > 0 {
            self.shard_size
        } else if self.shard_count > 0 {
            total.div_ceil(self.shard_count).max(1)
        } else {
            DEFAULT_SHARD_SIZE
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle record stored under `jobs/<id>/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A job with its spec and lifecycle state, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub spec: JobSpec,
    #[serde(flatten)]
    pub state: JobStateRecord,
}

/// Half-open range of CT leaf indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub lo: u64,
    pub hi: u64,
}

impl ShardRange {
    pub fn new(lo: u64, hi: u64) -> Result<Self> {
        if lo >= hi {
            return Err(Error::validation(format!("empty shard range [{lo}, {hi})")));
        }
        Ok(Self { lo, hi })
    }

    pub fn len(&self) -> u64 {
        self.hi - self.lo
    }

    pub fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }
}

impl std::fmt::Display for ShardRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.lo, self.hi)
    }
}

/// Durable per-shard progress record, mutated only by coordinator
/// transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub range: ShardRange,
    pub done: bool,
    pub failed: bool,
    #[serde(default)]
    pub last_assignee: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ShardStatus {
    pub fn fresh(range: ShardRange) -> Self {
        Self {
            range,
            done: false,
            failed: false,
            last_assignee: None,
            last_error: None,
        }
    }

    /// A shard still in play: neither finished nor parked by a failure.
    pub fn is_open(&self) -> bool {
        !self.done && !self.failed
    }
}

/// Exclusive shard ownership record, bound to a KV lease. The lease is
/// what makes ownership real; the timestamps are advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub job_id: String,
    pub shard_id: u64,
    pub worker_id: String,
    pub lease_id: i64,
    pub lease_expiry: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

/// One output object produced by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub name: String,
    pub bytes: u64,
    pub records: u64,
    pub sha256: String,
}

/// Written once when a shard completes; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardManifest {
    pub shard_id: u64,
    pub range: ShardRange,
    pub records: u64,
    pub bytes: u64,
    pub chunks: Vec<ChunkInfo>,
}

/// Worker presence record, held under the heartbeat lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            version: SPEC_VERSION,
            log_uri: "https://ct.example.net/log".into(),
            start: 0,
            end: Some(1000),
            output: OutputOptions {
                extractor: "raw".into(),
                transformer: "jsonl".into(),
                sink: "null".into(),
                ..Default::default()
            },
            shard_size: 0,
            shard_count: 0,
        }
    }

    #[test]
    fn validates_spec() {
        assert!(spec().validate().is_ok());

        let mut bad = spec();
        bad.end = Some(0);
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.output.sink.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn shard_size_derivation() {
        let mut s = spec();
        assert_eq!(s.effective_shard_size(1000), DEFAULT_SHARD_SIZE);
        s.shard_count = 3;
        assert_eq!(s.effective_shard_size(1000), 334);
        s.shard_size = 50;
        assert_eq!(s.effective_shard_size(1000), 50);
    }

    #[test]
    fn range_rejects_empty() {
        assert!(ShardRange::new(5, 5).is_err());
        assert_eq!(ShardRange::new(0, 10).unwrap().len(), 10);
    }
}
