//! S3-compatible object store sink.
//!
//! Each chunk is buffered (in memory or a temp file) and uploaded as a
//! single `PutObject` on close, so a failed upload never leaves a
//! partial object behind. Credentials are looked up in the secrets
//! store when a chunk opens, not when the sink is built.

use std::sync::Arc;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Region, RequestChecksumCalculation};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use crate::compress::Algo;
use crate::error::{Error, Result};
use crate::secrets::SecretStore;

use super::{
    build_object_key, compression_from, opt_bool, opt_str, req_str, BufferKind, ChunkBuffer,
    FinishedBuffer, Sink, SinkOptions, SinkWriter,
};

pub struct S3Sink {
    bucket: String,
    region: String,
    prefix: String,
    endpoint: Option<String>,
    compression: Algo,
    buffer: BufferKind,
    disable_checksums: bool,
    access_key_id_secret: Option<String>,
    access_key_secret: Option<String>,
    secrets: Arc<SecretStore>,
}

impl S3Sink {
    pub fn from_options(opts: &SinkOptions, secrets: Arc<SecretStore>) -> Result<Self> {
        Ok(Self {
            bucket: req_str(opts, "bucket")?,
            region: req_str(opts, "region")?,
            prefix: opt_str(opts, "prefix").unwrap_or_default(),
            endpoint: opt_str(opts, "endpoint").or_else(|| opt_str(opts, "base_endpoint")),
            compression: compression_from(opts)?,
            buffer: BufferKind::from_options(opts)?,
            disable_checksums: opt_bool(opts, "disable_checksums"),
            access_key_id_secret: opt_str(opts, "access_key_id_secret"),
            access_key_secret: opt_str(opts, "access_key_secret"),
            secrets,
        })
    }

    async fn client(&self) -> Result<aws_sdk_s3::Client> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));

        if let (Some(id_key), Some(secret_key)) =
            (&self.access_key_id_secret, &self.access_key_secret)
        {
            let id = String::from_utf8(self.secrets.get(id_key).await?)
                .map_err(|_| Error::corrupt("access key id is not utf-8"))?;
            let secret = String::from_utf8(self.secrets.get(secret_key).await?)
                .map_err(|_| Error::corrupt("access key is not utf-8"))?;
            loader = loader.credentials_provider(Credentials::new(id, secret, None, None, "ctsnarf"));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        if self.disable_checksums {
            builder =
                builder.request_checksum_calculation(RequestChecksumCalculation::WhenRequired);
        }
        Ok(aws_sdk_s3::Client::from_conf(builder.build()))
    }
}

#[async_trait]
impl Sink for S3Sink {
    async fn open(&self, name: &str) -> Result<Box<dyn SinkWriter>> {
        let client = self.client().await?;
        Ok(Box::new(S3Writer {
            client,
            bucket: self.bucket.clone(),
            key: build_object_key(&self.prefix, name),
            buffer: Some(ChunkBuffer::new(self.buffer, self.compression)?),
        }))
    }
}

struct S3Writer {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    buffer: Option<ChunkBuffer>,
}

#[async_trait]
impl SinkWriter for S3Writer {
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

        // Temp files must outlive the upload; bind before sending.
        let _guard;
        let (body, len) = match buffer.finish()? {
            FinishedBuffer::Memory(bytes) => {
                let len = bytes.len() as u64;
                (ByteStream::from(bytes), len)
            }
            FinishedBuffer::Disk(file, len) => {
                let body = ByteStream::from_path(file.path())
                    .await
                    .map_err(|e| Error::fatal(format!("staging upload: {e}")))?;
                _guard = file;
                (body, len)
            }
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transient(format!("s3 put: {}", DisplayErrorContext(&e))))?;
        debug!(bucket = %self.bucket, key = %self.key, bytes = len, "uploaded chunk");
        Ok(())
    }
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
    fn requires_bucket_and_region() {
        let mut opts = SinkOptions::new();
        assert!(S3Sink::from_options(&opts, secrets()).is_err());
        opts.insert("bucket".into(), "b".into());
        assert!(S3Sink::from_options(&opts, secrets()).is_err());
        opts.insert("region".into(), "us-east-1".into());
        assert!(S3Sink::from_options(&opts, secrets()).is_ok());
    }

    #[test]
    fn accepts_either_endpoint_key() {
        let mut opts = SinkOptions::new();
        opts.insert("bucket".into(), "b".into());
        opts.insert("region".into(), "r".into());
        opts.insert("base_endpoint".into(), "http://minio:9000".into());
        let sink = S3Sink::from_options(&opts, secrets()).unwrap();
        assert_eq!(sink.endpoint.as_deref(), Some("http://minio:9000"));
    }
}
