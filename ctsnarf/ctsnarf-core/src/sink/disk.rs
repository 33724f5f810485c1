//! Local filesystem sink.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::compress::{self, Algo, CompressWrite};
use crate::error::{Error, Result};

use super::{compression_from, req_str, Sink, SinkOptions, SinkWriter};

/// Writes chunks to `<path>/<name>`, creating parent directories as
/// needed and applying optional compression in front of the file.
pub struct DiskSink {
    root: PathBuf,
    compression: Algo,
}

impl DiskSink {
    pub fn from_options(opts: &SinkOptions) -> Result<Self> {
        Ok(Self {
            root: PathBuf::from(req_str(opts, "path")?),
            compression: compression_from(opts)?,
        })
    }
}

#[async_trait]
impl Sink for DiskSink {
    async fn open(&self, name: &str) -> Result<Box<dyn SinkWriter>> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&path)
            .map_err(|e| Error::fatal(format!("creating {}: {e}", path.display())))?;
        Ok(Box::new(DiskWriter {
            writer: compress::writer(file, self.compression)?,
        }))
    }
}

struct DiskWriter {
    writer: Box<dyn CompressWrite>,
}

#[async_trait]
impl SinkWriter for DiskWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.writer.write_all(buf)?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.writer.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_chunks_under_root() {
        let dir = TempDir::new().unwrap();
        let mut opts = SinkOptions::new();
        opts.insert("path".into(), dir.path().to_str().unwrap().into());
        let sink = DiskSink::from_options(&opts).unwrap();

        let mut w = sink.open("out/chunk.0001").await.unwrap();
        w.write(b"abc").await.unwrap();
        w.close().await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("out/chunk.0001")).unwrap(),
            b"abc"
        );
    }

    #[tokio::test]
    async fn compresses_when_asked() {
        let dir = TempDir::new().unwrap();
        let mut opts = SinkOptions::new();
        opts.insert("path".into(), dir.path().to_str().unwrap().into());
        opts.insert("compression".into(), "gzip".into());
        let sink = DiskSink::from_options(&opts).unwrap();

        let mut w = sink.open("chunk").await.unwrap();
        w.write(b"payload payload payload").await.unwrap();
        w.close().await.unwrap();

        let raw = std::fs::read(dir.path().join("chunk")).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        use std::io::Read;
        let mut out = Vec::new();
        compress::reader(std::io::Cursor::new(raw), Algo::Gzip)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"payload payload payload");
    }

    #[test]
    fn path_is_required() {
        assert!(DiskSink::from_options(&SinkOptions::new()).is_err());
    }
}
