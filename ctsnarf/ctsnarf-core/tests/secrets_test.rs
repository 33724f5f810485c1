//! Integration test for the secrets bootstrap flow: node registration,
//! admin approval, and encrypted reads and writes afterwards.

use std::sync::Arc;
use std::time::Duration;

use ctsnarf_core::kv::{KeyPath, Kv, MemoryKv};
use ctsnarf_core::secrets::SecretStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn bootstrap_approval_and_secret_roundtrip() {
    let dir = TempDir::new().unwrap();
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());

    let node = Arc::new(
        SecretStore::open(kv.clone(), dir.path().join("node.json"), "/test").unwrap(),
    );
    let admin =
        SecretStore::open(kv.clone(), dir.path().join("admin.json"), "/test").unwrap();
    let node_id = node.node_id().to_string();

    let cluster_key = SecretStore::generate_cluster_key();

    // Node blocks waiting for approval.
    let waiting = {
        let node = node.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            node.register_and_wait(&cancel).await
        })
    };

    // Wait for the pending registration to show up, then approve.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = admin.list_pending().await.unwrap();
        if pending.contains(&node_id) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registration never appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    admin.approve_node(&node_id, &cluster_key).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("bootstrap timed out")
        .unwrap()
        .unwrap();

    // The pending registration is cleaned up.
    assert!(admin.list_pending().await.unwrap().is_empty());

    // The node can now use the store.
    node.set("k", b"v").await.unwrap();
    assert_eq!(node.get("k").await.unwrap(), b"v");

    // And what it wrote is ciphertext: a one-byte secret still carries
    // the 24-byte nonce and 16-byte MAC under the base64.
    let raw = kv
        .get(&KeyPath::Secret("k").resolve("/test"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(raw.value, b"v");
    assert!(raw.value.len() >= 56);
}

#[tokio::test]
async fn approve_without_registration_is_not_found() {
    let dir = TempDir::new().unwrap();
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    let admin = SecretStore::open(kv, dir.path().join("admin.json"), "/test").unwrap();

    let err = admin
        .approve_node("deadbeef", &SecretStore::generate_cluster_key())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn cancellation_unblocks_registration() {
    let dir = TempDir::new().unwrap();
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    let node = SecretStore::open(kv, dir.path().join("node.json"), "/test").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = node.register_and_wait(&cancel).await.unwrap_err();
    assert!(err.is_transient());
}
