//! Distributed secrets store.
//!
//! Every node holds a NaCl box keypair on local disk. A new node
//! publishes its public key as a pending registration and waits for an
//! administrator to seal the cluster-wide symmetric key to it. Once the
//! sealed key is opened, the node can read and write secrets, which are
//! stored as secretbox ciphertexts (fresh 24-byte nonce per write) in
//! the coordination KV.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_box::{aead::OsRng, PublicKey, SecretKey};
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::kv::{KeyPath, Kv};

const CLUSTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const REGISTRATION_POLL: Duration = Duration::from_secs(2);

/// On-disk keypair file. Both keys are 32-byte NaCl box keys.
#[derive(Serialize, Deserialize)]
struct KeypairFile {
    #[serde(rename = "pub")]
    public: String,
    #[serde(rename = "priv")]
    secret: String,
}

pub struct SecretStore {
    kv: Arc<dyn Kv>,
    prefix: String,
    node_id: String,
    public: PublicKey,
    secret: SecretKey,
    cluster_key: RwLock<Option<[u8; CLUSTER_KEY_LEN]>>,
}

impl SecretStore {
    /// Load the node keypair from `key_path`, generating and persisting
    /// one (file mode 0600, parent directory 0700) if none exists.
    pub fn open(kv: Arc<dyn Kv>, key_path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let (public, secret) = load_or_generate_keypair(key_path.as_ref())?;
        let node_id = node_id_for(&public);
        Ok(Self {
            kv,
            prefix: prefix.to_string(),
            node_id,
            public,
            secret,
            cluster_key: RwLock::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 32 cryptographically random bytes, suitable as a cluster key.
    pub fn generate_cluster_key() -> [u8; CLUSTER_KEY_LEN] {
        let mut key = [0u8; CLUSTER_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    fn key(&self, path: KeyPath<'_>) -> String {
        path.resolve(&self.prefix)
    }

    fn cluster_key(&self) -> Result<[u8; CLUSTER_KEY_LEN]> {
        self.cluster_key
            .read()
            .unwrap()
            .ok_or_else(|| Error::fatal("secret store not bootstrapped: no cluster key"))
    }

    /// Install a cluster key directly. Used by the administrator side,
    /// which holds the key it is approving nodes with.
    pub fn set_cluster_key(&self, key: [u8; CLUSTER_KEY_LEN]) {
        *self.cluster_key.write().unwrap() = Some(key);
    }

    /// Publish this node's public key as a pending registration and
    /// block until an administrator seals the cluster key to it.
    ///
    /// May wait indefinitely; cancellation propagates through `cancel`.
    pub async fn register_and_wait(&self, cancel: &CancellationToken) -> Result<()> {
        let pending_key = self.key(KeyPath::PendingRegistration(&self.node_id));
        let sealed_key = self.key(KeyPath::NodeKey(&self.node_id));

        // Subscribe before the existence check so an approval landing
        // in between is not missed.
        let mut watch = self.kv.watch(&sealed_key).await?;

        self.kv
            .put(
                &pending_key,
                BASE64.encode(self.public.as_bytes()).into_bytes(),
                None,
            )
            .await?;
        info!(node_id = %self.node_id, "registered node, waiting for approval");

        let mut poll = tokio::time::interval(REGISTRATION_POLL);
        loop {
            if let Some(kv) = self.kv.get(&sealed_key).await? {
                self.unseal_cluster_key(&kv.value)?;
                // Best-effort cleanup of the pending entry.
                let _ = self.kv.delete(&pending_key).await;
                info!(node_id = %self.node_id, "cluster key received");
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::transient("registration cancelled"));
                }
                _ = watch.recv() => {}
                _ = poll.tick() => {}
            }
        }
    }

    fn unseal_cluster_key(&self, stored: &[u8]) -> Result<()> {
        let sealed = BASE64
            .decode(stored)
            .map_err(|e| Error::corrupt(format!("sealed cluster key: {e}")))?;
        let plain = self
            .secret
            .unseal(&sealed)
            .map_err(|_| Error::corrupt("sealed cluster key does not open with node key"))?;
        let key: [u8; CLUSTER_KEY_LEN] = plain
            .as_slice()
            .try_into()
            .map_err(|_| Error::corrupt("cluster key has wrong length"))?;
        self.set_cluster_key(key);
        Ok(())
    }

    /// Administrator operation: seal `cluster_key` to the pending
    /// node's public key and remove the pending registration.
    pub async fn approve_node(&self, node_id: &str, cluster_key: &[u8]) -> Result<()> {
        let pending_key = self.key(KeyPath::PendingRegistration(node_id));
        let pending = self
            .kv
            .get(&pending_key)
            .await?
            .ok_or_else(|| Error::not_found(format!("no pending registration for {node_id}")))?;

        let pub_bytes = BASE64
            .decode(&pending.value)
            .map_err(|e| Error::corrupt(format!("pending public key: {e}")))?;
        let pub_bytes: [u8; 32] = pub_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::corrupt("pending public key has wrong length"))?;
        let node_pub = PublicKey::from(pub_bytes);

        let sealed = node_pub
            .seal(&mut OsRng, cluster_key)
            .map_err(|_| Error::corrupt("sealing cluster key failed"))?;
        self.kv
            .put(
                &self.key(KeyPath::NodeKey(node_id)),
                BASE64.encode(sealed).into_bytes(),
                None,
            )
            .await?;
        self.kv.delete(&pending_key).await?;
        info!(node_id, "approved node");
        Ok(())
    }

    /// Store a secret. Overwrites unconditionally; every write uses a
    /// fresh random nonce.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let cluster_key = self.cluster_key()?;
        let cipher = XSalsa20Poly1305::new_from_slice(&cluster_key)
            .map_err(|_| Error::corrupt("bad cluster key"))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, value)
            .map_err(|_| Error::corrupt("secret encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);

        self.kv
            .put(
                &self.key(KeyPath::Secret(key)),
                BASE64.encode(payload).into_bytes(),
                None,
            )
            .await?;
        debug!(key, "stored secret");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let cluster_key = self.cluster_key()?;
        let stored = self
            .kv
            .get(&self.key(KeyPath::Secret(key)))
            .await?
            .ok_or_else(|| Error::not_found(format!("secret {key}")))?;

        let payload = BASE64
            .decode(&stored.value)
            .map_err(|e| Error::corrupt(format!("secret {key}: {e}")))?;
        if payload.len() < NONCE_LEN {
            return Err(Error::corrupt(format!("secret {key}: truncated payload")));
        }
        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);

        let cipher = XSalsa20Poly1305::new_from_slice(&cluster_key)
            .map_err(|_| Error::corrupt("bad cluster key"))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| Error::corrupt(format!("secret {key}: authentication failed")))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(&self.key(KeyPath::Secret(key))).await
    }

    /// List stored secret names under `prefix`, relative to the store.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.key(KeyPath::SecretsPrefix);
        let full = format!("{root}{prefix}");
        let kvs = self.kv.range(&full, true).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|kv| kv.key.strip_prefix(&root).map(|s| s.to_string()))
            .collect())
    }

    /// List node IDs with pending registrations.
    pub async fn list_pending(&self) -> Result<Vec<String>> {
        let root = self.key(KeyPath::PendingPrefix);
        let kvs = self.kv.range(&root, true).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|kv| kv.key.strip_prefix(&root).map(|s| s.to_string()))
            .collect())
    }
}

/// `hex(SHA256(pub))` — the stable node identity.
fn node_id_for(public: &PublicKey) -> String {
    hex::encode(Sha256::digest(public.as_bytes()))
}

fn load_or_generate_keypair(path: &Path) -> Result<(PublicKey, SecretKey)> {
    if path.exists() {
        let raw = std::fs::read(path)?;
        let file: KeypairFile = serde_json::from_slice(&raw)
            .map_err(|e| Error::corrupt(format!("node key file: {e}")))?;
        let public = decode_key32(&file.public)?;
        let secret = decode_key32(&file.secret)?;
        return Ok((PublicKey::from(public), SecretKey::from(secret)));
    }

    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    persist_keypair(path, &public, &secret)?;
    Ok((public, secret))
}

fn decode_key32(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::corrupt(format!("node key file: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::corrupt("node key file: key has wrong length"))
}

fn persist_keypair(path: &Path, public: &PublicKey, secret: &SecretKey) -> Result<PathBuf> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    let file = KeypairFile {
        public: BASE64.encode(public.as_bytes()),
        secret: BASE64.encode(secret.to_bytes()),
    };
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(&serde_json::to_vec(&file)?)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use tempfile::TempDir;

    fn store(dir: &TempDir, kv: Arc<dyn Kv>, name: &str) -> SecretStore {
        SecretStore::open(kv, dir.path().join(name), "/test").unwrap()
    }

    #[test]
    fn node_id_is_sha256_of_pubkey() {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        let id = node_id_for(&public);
        assert_eq!(id.len(), 64);
        assert_eq!(id, hex::encode(Sha256::digest(public.as_bytes())));
    }

    #[test]
    fn keypair_roundtrips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("node.json");
        let (pub1, _) = load_or_generate_keypair(&path).unwrap();
        let (pub2, _) = load_or_generate_keypair(&path).unwrap();
        assert_eq!(pub1.as_bytes(), pub2.as_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn set_get_roundtrip_and_nonce_freshness() {
        let dir = TempDir::new().unwrap();
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let store = store(&dir, kv.clone(), "node.json");
        store.set_cluster_key(SecretStore::generate_cluster_key());

        store.set("db/password", b"hunter2").await.unwrap();
        assert_eq!(store.get("db/password").await.unwrap(), b"hunter2");

        // Same plaintext twice must not produce the same ciphertext.
        let key = KeyPath::Secret("db/password").resolve("/test");
        let first = kv.get(&key).await.unwrap().unwrap().value;
        store.set("db/password", b"hunter2").await.unwrap();
        let second = kv.get(&key).await.unwrap().unwrap().value;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn get_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let store = store(&dir, kv.clone(), "node.json");
        store.set_cluster_key(SecretStore::generate_cluster_key());

        assert!(store.get("nope").await.unwrap_err().is_not_found());

        let key = KeyPath::Secret("bad").resolve("/test");
        kv.put(&key, b"!!not-base64!!".to_vec(), None).await.unwrap();
        assert!(matches!(
            store.get("bad").await.unwrap_err(),
            Error::Corrupt(_)
        ));
    }

    #[tokio::test]
    async fn list_returns_relative_keys() {
        let dir = TempDir::new().unwrap();
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let store = store(&dir, kv, "node.json");
        store.set_cluster_key(SecretStore::generate_cluster_key());

        store.set("aws/key_id", b"a").await.unwrap();
        store.set("aws/key", b"b").await.unwrap();
        store.set("other", b"c").await.unwrap();

        let mut listed = store.list("aws/").await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["aws/key", "aws/key_id"]);
    }
}
