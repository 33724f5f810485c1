//! Sink abstraction: named backends that accept chunk write streams.
//!
//! A `Sink` opens one `SinkWriter` per chunk; after a successful
//! `close` the chunk is durably delivered. Writers are not shared
//! across tasks — the pipeline owns exactly one at a time. Factories
//! are looked up by name from the job spec and receive the sink
//! options plus a secrets handle for credential lookup at open time.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::compress::{self, Algo, CompressWrite};
use crate::error::{Error, Result};
use crate::secrets::SecretStore;

mod azure;
mod basic;
mod disk;
mod http;
mod s3;

pub use azure::AzureBlobSink;
pub use basic::{NullSink, StdoutSink};
pub use disk::DiskSink;
pub use http::HttpSink;
pub use s3::S3Sink;

pub type SinkOptions = BTreeMap<String, Value>;

/// Byte sink for one chunk. Bytes are durable once `close` returns.
#[async_trait]
pub trait SinkWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn open(&self, name: &str) -> Result<Box<dyn SinkWriter>>;
}

type Factory =
    Arc<dyn Fn(&SinkOptions, Arc<SecretStore>) -> Result<Box<dyn Sink>> + Send + Sync>;

/// Named sink factories, populated once at startup.
#[derive(Clone)]
pub struct SinkRegistry {
    by_name: HashMap<String, Factory>,
}

impl SinkRegistry {
    pub fn empty() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        fn disk(opts: &SinkOptions, _: Arc<SecretStore>) -> Result<Box<dyn Sink>> {
            Ok(Box::new(DiskSink::from_options(opts)?))
        }
        fn s3(opts: &SinkOptions, secrets: Arc<SecretStore>) -> Result<Box<dyn Sink>> {
            Ok(Box::new(S3Sink::from_options(opts, secrets)?))
        }
        fn azureblob(opts: &SinkOptions, secrets: Arc<SecretStore>) -> Result<Box<dyn Sink>> {
            Ok(Box::new(AzureBlobSink::from_options(opts, secrets)?))
        }
        fn http(opts: &SinkOptions, _: Arc<SecretStore>) -> Result<Box<dyn Sink>> {
            Ok(Box::new(HttpSink::from_options(opts)?))
        }
        fn stdout(_: &SinkOptions, _: Arc<SecretStore>) -> Result<Box<dyn Sink>> {
            Ok(Box::new(StdoutSink))
        }
        fn null(_: &SinkOptions, _: Arc<SecretStore>) -> Result<Box<dyn Sink>> {
            Ok(Box::new(NullSink))
        }

        let mut reg = Self::empty();
        reg.register("disk", Arc::new(disk));
        reg.register("s3", Arc::new(s3));
        reg.register("azureblob", Arc::new(azureblob));
        reg.register("http", Arc::new(http));
        reg.register("stdout", Arc::new(stdout));
        reg.register("null", Arc::new(null));
        reg
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.by_name.insert(name.to_string(), factory);
    }

    pub fn build(
        &self,
        name: &str,
        options: &SinkOptions,
        secrets: Arc<SecretStore>,
    ) -> Result<Box<dyn Sink>> {
        let factory = self
            .by_name
            .get(name)
            .ok_or_else(|| Error::validation(format!("unknown sink {name:?}")))?;
        factory(options, secrets)
    }
}

/// Join an object key prefix and a chunk name: both sides are trimmed
/// of stray slashes and any doubled separators are collapsed, so
/// configured prefixes never produce empty path segments.
pub fn build_object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    let mut key = if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    };
    while key.contains("//") {
        key = key.replace("//", "/");
    }
    key
}

// ── option parsing helpers ──────────────────────────────────────────

pub(crate) fn req_str(opts: &SinkOptions, key: &str) -> Result<String> {
    opt_str(opts, key).ok_or_else(|| Error::validation(format!("sink option {key:?} is required")))
}

pub(crate) fn opt_str(opts: &SinkOptions, key: &str) -> Option<String> {
    opts.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn opt_bool(opts: &SinkOptions, key: &str) -> bool {
    match opts.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true" || s == "1",
        _ => false,
    }
}

pub(crate) fn opt_u64(opts: &SinkOptions, key: &str, default: u64) -> u64 {
    match opts.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

pub(crate) fn compression_from(opts: &SinkOptions) -> Result<Algo> {
    Algo::parse(&opt_str(opts, "compression").unwrap_or_default())
}

// ── chunk buffering shared by the object-store sinks ────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferKind {
    Memory,
    Disk,
}

impl BufferKind {
    pub(crate) fn from_options(opts: &SinkOptions) -> Result<Self> {
        match opt_str(opts, "buffer_type").as_deref() {
            None | Some("") | Some("memory") => Ok(BufferKind::Memory),
            Some("disk") => Ok(BufferKind::Disk),
            Some(other) => Err(Error::validation(format!(
                "unknown buffer_type {other:?}"
            ))),
        }
    }
}

/// Accumulates one (optionally compressed) chunk in memory or in a
/// temp file, to be uploaded wholesale on close. The buffer lives
/// strictly for one open..close lifetime; dropping it discards any
/// partial chunk.
pub(crate) struct ChunkBuffer {
    writer: Box<dyn CompressWrite>,
    dest: BufferDest,
}

enum BufferDest {
    Memory(Arc<Mutex<Vec<u8>>>),
    Disk(tempfile::NamedTempFile),
}

pub(crate) enum FinishedBuffer {
    Memory(Vec<u8>),
    Disk(tempfile::NamedTempFile, u64),
}

impl ChunkBuffer {
    pub(crate) fn new(kind: BufferKind, algo: Algo) -> Result<Self> {
        match kind {
            BufferKind::Memory => {
                let shared = Arc::new(Mutex::new(Vec::new()));
                let writer = compress::writer(SharedVec(shared.clone()), algo)?;
                Ok(Self {
                    writer,
                    dest: BufferDest::Memory(shared),
                })
            }
            BufferKind::Disk => {
                let file = tempfile::NamedTempFile::new()?;
                let writer = compress::writer(file.reopen()?, algo)?;
                Ok(Self {
                    writer,
                    dest: BufferDest::Disk(file),
                })
            }
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<FinishedBuffer> {
        self.writer.finish()?;
        match self.dest {
            BufferDest::Memory(shared) => {
                let bytes = std::mem::take(&mut *shared.lock().unwrap());
                Ok(FinishedBuffer::Memory(bytes))
            }
            BufferDest::Disk(file) => {
                let len = file.as_file().metadata()?.len();
                Ok(FinishedBuffer::Disk(file, len))
            }
        }
    }
}

struct SharedVec(Arc<Mutex<Vec<u8>>>);

impl Write for SharedVec {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_assembly() {
        assert_eq!(build_object_key("foo/", "bar.txt"), "foo/bar.txt");
        assert_eq!(build_object_key("foo", "bar.txt"), "foo/bar.txt");
        assert_eq!(build_object_key("foo//", "/bar.txt"), "foo/bar.txt");
        assert_eq!(build_object_key("", "bar.txt"), "bar.txt");
        assert_eq!(build_object_key("/", "bar.txt"), "bar.txt");
        assert_eq!(build_object_key("foo/bar", "baz.txt"), "foo/bar/baz.txt");
    }

    #[test]
    fn buffer_roundtrip_memory_and_disk() {
        for kind in [BufferKind::Memory, BufferKind::Disk] {
            let mut buf = ChunkBuffer::new(kind, Algo::None).unwrap();
            buf.write(b"hello ").unwrap();
            buf.write(b"world").unwrap();
            match buf.finish().unwrap() {
                FinishedBuffer::Memory(bytes) => assert_eq!(bytes, b"hello world"),
                FinishedBuffer::Disk(file, len) => {
                    assert_eq!(len, 11);
                    assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world");
                }
            }
        }
    }

    #[test]
    fn buffer_kind_parsing() {
        let mut opts = SinkOptions::new();
        assert_eq!(BufferKind::from_options(&opts).unwrap(), BufferKind::Memory);
        opts.insert("buffer_type".into(), "disk".into());
        assert_eq!(BufferKind::from_options(&opts).unwrap(), BufferKind::Disk);
        opts.insert("buffer_type".into(), "tape".into());
        assert!(BufferKind::from_options(&opts).is_err());
    }
}
