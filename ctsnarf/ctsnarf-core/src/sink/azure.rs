//! Azure Blob Storage sink.
//!
//! Talks to the Blob REST API directly over reqwest with shared-key
//! request signing rather than pulling in the Azure SDK stack. Chunks
//! are buffered like the S3 sink and uploaded as one Put Blob call.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::compress::Algo;
use crate::error::{Error, Result};
use crate::secrets::SecretStore;

use super::{
    build_object_key, compression_from, opt_str, req_str, BufferKind, ChunkBuffer,
    FinishedBuffer, Sink, SinkOptions, SinkWriter,
};

const API_VERSION: &str = "2020-10-02";
const UPLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct AzureBlobSink {
    account: String,
    container: String,
    prefix: String,
    compression: Algo,
    buffer: BufferKind,
    access_key_secret: Option<String>,
    secrets: Arc<SecretStore>,
    http: reqwest::Client,
}

impl AzureBlobSink {
    pub fn from_options(opts: &SinkOptions, secrets: Arc<SecretStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::fatal(format!("building http client: {e}")))?;
        Ok(Self {
            account: req_str(opts, "account")?,
            container: req_str(opts, "container")?,
            prefix: opt_str(opts, "prefix").unwrap_or_default(),
            compression: compression_from(opts)?,
            buffer: BufferKind::from_options(opts)?,
            access_key_secret: opt_str(opts, "access_key_secret"),
            secrets,
            http,
        })
    }
}

#[async_trait]
impl Sink for AzureBlobSink {
    async fn open(&self, name: &str) -> Result<Box<dyn SinkWriter>> {
        let access_key = match &self.access_key_secret {
            Some(secret_name) => {
                let raw = self.secrets.get(secret_name).await?;
                let encoded = String::from_utf8(raw)
                    .map_err(|_| Error::corrupt("azure access key is not utf-8"))?;
                Some(
                    BASE64
                        .decode(encoded.trim())
                        .map_err(|e| Error::corrupt(format!("azure access key: {e}")))?,
                )
            }
            None => None,
        };
        Ok(Box::new(AzureBlobWriter {
            http: self.http.clone(),
            account: self.account.clone(),
            container: self.container.clone(),
            blob: build_object_key(&self.prefix, name),
            access_key,
            buffer: Some(ChunkBuffer::new(self.buffer, self.compression)?),
        }))
    }
}

struct AzureBlobWriter {
    http: reqwest::Client,
    account: String,
    container: String,
    blob: String,
    access_key: Option<Vec<u8>>,
    buffer: Option<ChunkBuffer>,
}

#[async_trait]
impl SinkWriter for AzureBlobWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buffer
            .as_mut()
            .ok_or_else(|| Error::fatal("write after close"))?
            .write(buf)
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let buffer = self
            .buffer
            .take()
            .ok_or_else(|| Error::fatal("double close"))?;

        let _guard;
        let (body, len) = match buffer.finish()? {
            FinishedBuffer::Memory(bytes) => {
                let len = bytes.len() as u64;
                (reqwest::Body::from(bytes), len)
            }
            FinishedBuffer::Disk(file, len) => {
                let reader = tokio::fs::File::open(file.path()).await?;
                let stream = tokio_util::io::ReaderStream::new(reader);
                _guard = file;
                (reqwest::Body::wrap_stream(stream), len)
            }
        };

        let url = format!(
            "https://{}.blob.core.windows.net/{}/{}",
            self.account, self.container, self.blob
        );
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut req = self
            .http
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body);

        if let Some(key) = &self.access_key {
            let signature = sign_put_blob(
                key,
                &self.account,
                &self.container,
                &self.blob,
                &date,
                len,
            )?;
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("SharedKey {}:{signature}", self.account),
            );
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = format!("azure put blob {url}: {status}: {body}");
            return if status.is_server_error() {
                Err(Error::transient(err))
            } else {
                Err(Error::fatal(err))
            };
        }
        debug!(blob = %self.blob, bytes = len, "uploaded blob");
        Ok(())
    }
}

/// Shared-key signature for a Put Blob request. The string-to-sign
/// layout is fixed by the Blob service authorization scheme.
fn sign_put_blob(
    key: &[u8],
    account: &str,
    container: &str,
    blob: &str,
    date: &str,
    content_length: u64,
) -> Result<String> {
    let length_field = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    let string_to_sign = format!(
        "PUT\n\n\n{length_field}\n\n\n\n\n\n\n\n\n\
         x-ms-blob-type:BlockBlob\nx-ms-date:{date}\nx-ms-version:{API_VERSION}\n\
         /{account}/{container}/{blob}"
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| Error::corrupt("azure access key has invalid length"))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Kv, MemoryKv};

    fn secrets() -> Arc<SecretStore> {
        let dir = tempfile::TempDir::new().unwrap();
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let store = SecretStore::open(kv, dir.path().join("node.json"), "/test").unwrap();
        Arc::new(store)
    }

    #[test]
    fn requires_account_and_container() {
        let mut opts = SinkOptions::new();
        assert!(AzureBlobSink::from_options(&opts, secrets()).is_err());
        opts.insert("account".into(), "acct".into());
        opts.insert("container".into(), "data".into());
        assert!(AzureBlobSink::from_options(&opts, secrets()).is_ok());
    }

    #[test]
    fn signature_is_deterministic() {
        let key = b"0123456789abcdef0123456789abcdef";
        let a = sign_put_blob(key, "acct", "c", "b.txt", "Mon, 01 Jan 2024 00:00:00 GMT", 10)
            .unwrap();
        let b = sign_put_blob(key, "acct", "c", "b.txt", "Mon, 01 Jan 2024 00:00:00 GMT", 10)
            .unwrap();
        assert_eq!(a, b);
        let c = sign_put_blob(key, "acct", "c", "b.txt", "Mon, 01 Jan 2024 00:00:00 GMT", 11)
            .unwrap();
        assert_ne!(a, c);
    }
}
