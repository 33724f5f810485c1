//! Thin adapter over the coordination KV store.
//!
//! All cluster state lives in a strongly-consistent KV (etcd in
//! production, an in-memory store for tests and single-node runs).
//! Values are opaque bytes; callers JSON-encode structured data.
//! Transactions use version compares only: version 0 means the key is
//! absent, and a key read at version `v` can be updated atomically by
//! requiring `VersionEq(key, v)`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

mod etcd;
mod keys;
mod memory;

pub use etcd::EtcdKv;
pub use keys::{shard_id_from_key, KeyPath, DEFAULT_PREFIX};
pub use memory::MemoryKv;

pub type LeaseId = i64;

/// A key-value pair as read from the store.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Modification count since creation. 0 never occurs on a read
    /// result; it is only meaningful inside compares.
    pub version: i64,
}

/// Transaction compare. All compares must hold for `then_ops` to apply.
#[derive(Debug, Clone)]
pub enum Cmp {
    /// Key's version equals the given value; 0 asserts absence.
    VersionEq(String, i64),
}

/// Transaction mutation.
#[derive(Debug, Clone)]
pub enum Op {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

/// A compare-and-swap transaction.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Cmp>,
    pub then_ops: Vec<Op>,
    pub else_ops: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, cmp: Cmp) -> Self {
        self.compares.push(cmp);
        self
    }

    pub fn then(mut self, op: Op) -> Self {
        self.then_ops.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change observed by a prefix watch.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Vec<u8>,
}

/// Coordination KV interface.
///
/// Implementations must provide linearizable single-key operations and
/// serializable transactions; that ordering is what arbitrates shard
/// acquisition races between workers.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Read every key under `prefix`. With `keys_only`, values are empty
    /// but versions are still populated.
    async fn range(&self, prefix: &str, keys_only: bool) -> Result<Vec<KeyValue>>;

    /// Execute a transaction; returns whether the compares held.
    async fn txn(&self, txn: Txn) -> Result<bool>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Renew a lease. Returns `LeaseLost` if it has already expired.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Stream changes under `prefix`. The stream ends when the receiver
    /// is dropped or the backend connection closes.
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>>;
}
