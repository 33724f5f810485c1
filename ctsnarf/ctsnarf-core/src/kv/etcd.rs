//! etcd-backed implementation of the KV adapter.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions,
    Txn as EtcdTxn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Error, Result};

use super::{Cmp, EventKind, KeyValue, Kv, LeaseId, Op, Txn, WatchEvent};

/// Production KV adapter over an etcd cluster.
///
/// The client is cheaply cloneable (it shares a gRPC channel), so each
/// operation clones it to get the required mutable handle.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    fn convert_op(op: Op) -> TxnOp {
        match op {
            Op::Put { key, value, lease } => {
                let opts = lease.map(|id| PutOptions::new().with_lease(id));
                TxnOp::put(key, value, opts)
            }
            Op::Delete { key } => TxnOp::delete(key, None),
        }
    }

    fn convert_cmp(cmp: Cmp) -> Compare {
        match cmp {
            Cmp::VersionEq(key, version) => Compare::version(key, CompareOp::Equal, version),
        }
    }
}

#[async_trait]
impl Kv for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            version: kv.version(),
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let opts = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, opts).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }

    async fn range(&self, prefix: &str, keys_only: bool) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let mut opts = GetOptions::new().with_prefix();
        if keys_only {
            opts = opts.with_keys_only();
        }
        let resp = client.get(prefix, Some(opts)).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                version: kv.version(),
            })
            .collect())
    }

    async fn txn(&self, txn: Txn) -> Result<bool> {
        let mut client = self.client.clone();
        let etcd_txn = EtcdTxn::new()
            .when(
                txn.compares
                    .into_iter()
                    .map(Self::convert_cmp)
                    .collect::<Vec<_>>(),
            )
            .and_then(
                txn.then_ops
                    .into_iter()
                    .map(Self::convert_op)
                    .collect::<Vec<_>>(),
            )
            .or_else(
                txn.else_ops
                    .into_iter()
                    .map(Self::convert_op)
                    .collect::<Vec<_>>(),
            );
        let resp = client.txn(etcd_txn).await?;
        Ok(resp.succeeded())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(Error::lease_lost(format!("lease {lease} expired"))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;
        let (tx, rx) = mpsc::channel(256);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // The watcher handle must outlive the stream or etcd cancels
            // the watch server-side.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let kind = match event.event_type() {
                                EventType::Put => EventKind::Put,
                                EventType::Delete => EventKind::Delete,
                            };
                            let ev = WatchEvent {
                                kind,
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value: kv.value().to_vec(),
                            };
                            if tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        warn!(prefix = %prefix, error = %err, "watch stream closed");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
