//! Error taxonomy shared by every component.
//!
//! The kinds are semantic: callers branch on them to decide whether to
//! retry, abandon, or surface the failure to the operator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad job spec, sink options, or other caller input.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing job, shard, worker, or secret.
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-swap transaction lost the race. Retryable.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller's lease (assignment or heartbeat) expired mid-operation.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Crypto or decode failure. Never retried, never partially exposed.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Network trouble, 5xx, KV timeout. Retryable from the outside.
    #[error("transient: {0}")]
    Transient(String),

    /// I/O failure or violated invariant.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn lease_lost(msg: impl Into<String>) -> Self {
        Error::LeaseLost(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Error::LeaseLost(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Error::Transient(format!("etcd: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(format!("json: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Fatal(format!("io: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transient(format!("http: {err}"))
    }
}
