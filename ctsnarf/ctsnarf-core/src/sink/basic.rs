//! Trivial sinks: stdout and the bit bucket.

use async_trait::async_trait;

use crate::error::Result;

use super::{Sink, SinkWriter};

/// Writes every chunk to process stdout; close is a no-op.
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    async fn open(&self, _name: &str) -> Result<Box<dyn SinkWriter>> {
        Ok(Box::new(StdoutWriter))
    }
}

struct StdoutWriter;

#[async_trait]
impl SinkWriter for StdoutWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        std::io::stdout().write_all(buf)?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        use std::io::Write;
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn open(&self, _name: &str) -> Result<Box<dyn SinkWriter>> {
        Ok(Box::new(NullWriter))
    }
}

struct NullWriter;

#[async_trait]
impl SinkWriter for NullWriter {
    async fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
