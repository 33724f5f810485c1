//! In-memory KV with the same semantics as the etcd adapter.
//!
//! Used by tests and single-node development runs. Leases carry real
//! deadlines: keys bound to a lease disappear once the deadline passes
//! (expiry is applied lazily at the start of every operation), and
//! `expire_lease` lets tests force the failover path deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};

use super::{Cmp, EventKind, KeyValue, Kv, LeaseId, Op, Txn, WatchEvent};

struct Entry {
    value: Vec<u8>,
    version: i64,
    lease: Option<LeaseId>,
}

struct Lease {
    deadline: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

pub struct MemoryKv {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Force a lease past its deadline, deleting its keys. Lets tests
    /// exercise failover without waiting out a real TTL.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(l) = inner.leases.get_mut(&lease) {
            l.deadline = Instant::now() - Duration::from_secs(1);
        }
        self.purge_expired(&mut inner);
    }

    fn purge_expired(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            inner.leases.remove(id);
        }
        let dead: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.lease.map(|l| expired.contains(&l)).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            inner.entries.remove(&key);
            let _ = self.events.send(WatchEvent {
                kind: EventKind::Delete,
                key,
                value: Vec::new(),
            });
        }
    }

    fn apply_put(&self, inner: &mut Inner, key: String, value: Vec<u8>, lease: Option<LeaseId>) {
        let version = inner.entries.get(&key).map(|e| e.version).unwrap_or(0) + 1;
        inner.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                version,
                lease,
            },
        );
        let _ = self.events.send(WatchEvent {
            kind: EventKind::Put,
            key,
            value,
        });
    }

    fn apply_delete(&self, inner: &mut Inner, key: &str) {
        if inner.entries.remove(key).is_some() {
            let _ = self.events.send(WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
            });
        }
    }

    fn apply_ops(&self, inner: &mut Inner, ops: Vec<Op>) {
        for op in ops {
            match op {
                Op::Put { key, value, lease } => self.apply_put(inner, key, value, lease),
                Op::Delete { key } => self.apply_delete(inner, &key),
            }
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        Ok(inner.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(Error::lease_lost(format!("lease {id} not found")));
            }
        }
        self.apply_put(&mut inner, key.to_string(), value, lease);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        self.apply_delete(&mut inner, key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let keys: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.apply_delete(&mut inner, &key);
        }
        Ok(())
    }

    async fn range(&self, prefix: &str, keys_only: bool) -> Result<Vec<KeyValue>> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: if keys_only { Vec::new() } else { e.value.clone() },
                version: e.version,
            })
            .collect())
    }

    async fn txn(&self, txn: Txn) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let succeeded = txn.compares.iter().all(|cmp| match cmp {
            Cmp::VersionEq(key, version) => {
                inner.entries.get(key).map(|e| e.version).unwrap_or(0) == *version
            }
        });
        let ops = if succeeded { txn.then_ops } else { txn.else_ops };
        for op in &ops {
            if let Op::Put {
                lease: Some(id), ..
            } = op
            {
                if !inner.leases.contains_key(id) {
                    return Err(Error::lease_lost(format!("lease {id} not found")));
                }
            }
        }
        self.apply_ops(&mut inner, ops);
        Ok(succeeded)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_lease += 1;
        let id = inner.next_lease;
        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        inner.leases.insert(
            id,
            Lease {
                deadline: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::lease_lost(format!("lease {lease} expired"))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.remove(&lease).is_some() {
            let dead: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.lease == Some(lease))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead {
                self.apply_delete(&mut inner, &key);
            }
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            while let Ok(ev) = events.recv().await {
                if !ev.key.starts_with(&prefix) {
                    continue;
                }
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_track_modifications() {
        let kv = MemoryKv::new();
        assert!(kv.get("a").await.unwrap().is_none());

        kv.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().unwrap().version, 1);

        kv.put("a", b"2".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().unwrap().version, 2);

        kv.delete("a").await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());

        // Recreation starts a fresh version history.
        kv.put("a", b"3".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn txn_version_compare() {
        let kv = MemoryKv::new();
        let create = Txn::new()
            .when(Cmp::VersionEq("k".into(), 0))
            .then(Op::Put {
                key: "k".into(),
                value: b"v".to_vec(),
                lease: None,
            });
        assert!(kv.txn(create.clone()).await.unwrap());
        // Second attempt loses the absence compare.
        assert!(!kv.txn(create).await.unwrap());
    }

    #[tokio::test]
    async fn lease_expiry_drops_bound_keys() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(60).await.unwrap();
        kv.put("leased", b"x".to_vec(), Some(lease)).await.unwrap();
        kv.put("plain", b"y".to_vec(), None).await.unwrap();

        kv.expire_lease(lease);

        assert!(kv.get("leased").await.unwrap().is_none());
        assert!(kv.get("plain").await.unwrap().is_some());
        assert!(kv.keep_alive(lease).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn watch_sees_prefix_changes() {
        let kv = MemoryKv::new();
        let mut rx = kv.watch("/a/").await.unwrap();
        kv.put("/b/out-of-scope", b"".to_vec(), None).await.unwrap();
        kv.put("/a/k", b"v".to_vec(), None).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.key, "/a/k");
        assert_eq!(ev.kind, EventKind::Put);
    }
}
