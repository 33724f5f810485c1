//! Per-shard streaming ETL pipeline.
//!
//! Consumes CT entries in ascending index order, runs each through the
//! extractor and transformer, and writes the output to the sink in
//! chunks bounded by bytes and/or records. Rotation closes the current
//! writer (footer included) and the next record opens a fresh chunk.
//! Any error aborts the stream; the open writer is abandoned and the
//! shard is the caller's to report.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::ChunkInfo;
use crate::ctlog::LogEntry;
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::sink::{Sink, SinkWriter};
use crate::transform::Transformer;

/// Totals for a completed stream; the worker folds this into the shard
/// manifest.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub records: u64,
    pub bytes: u64,
    pub chunks: Vec<ChunkInfo>,
}

pub struct Pipeline {
    extractor: Arc<dyn Extractor>,
    transformer: Box<dyn Transformer>,
    sink: Box<dyn Sink>,
    base_name: String,
    max_chunk_bytes: u64,
    max_chunk_records: u64,
}

struct OpenChunk {
    writer: Box<dyn SinkWriter>,
    name: String,
    digest: Sha256,
    /// Bytes of record output only; headers and footers don't count
    /// toward rotation.
    record_bytes: u64,
    records: u64,
    total_bytes: u64,
}

impl Pipeline {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        transformer: Box<dyn Transformer>,
        sink: Box<dyn Sink>,
        base_name: impl Into<String>,
        max_chunk_bytes: u64,
        max_chunk_records: u64,
    ) -> Self {
        Self {
            extractor,
            transformer,
            sink,
            base_name: base_name.into(),
            max_chunk_bytes,
            max_chunk_records,
        }
    }

    fn chunked(&self) -> bool {
        self.max_chunk_bytes > 0 || self.max_chunk_records > 0
    }

    fn chunk_name(&self, chunk_num: u32) -> String {
        if self.chunked() {
            format!("{}.{:04}", self.base_name, chunk_num)
        } else {
            self.base_name.clone()
        }
    }

    fn should_rotate(&self, chunk: &OpenChunk) -> bool {
        (self.max_chunk_bytes > 0 && chunk.record_bytes >= self.max_chunk_bytes)
            || (self.max_chunk_records > 0 && chunk.records >= self.max_chunk_records)
    }

    /// Drain `entries` through the pipeline until the stream ends, an
    /// error occurs, or `cancel` fires.
    pub async fn stream_process(
        mut self,
        cancel: &CancellationToken,
        entries: &mut mpsc::Receiver<Result<LogEntry>>,
    ) -> Result<PipelineOutput> {
        let mut out = PipelineOutput::default();
        let mut open: Option<OpenChunk> = None;
        let mut chunk_num = 0u32;

        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::transient("pipeline cancelled"));
                }
                entry = entries.recv() => entry,
            };
            let Some(entry) = entry else { break };
            let entry = entry?;

            let record = self.extractor.extract(&entry)?;
            let data = self.transformer.transform(&record)?;

            if open.is_none() {
                chunk_num += 1;
                let name = self.chunk_name(chunk_num);
                debug!(chunk = %name, "opening chunk");
                let mut chunk = OpenChunk {
                    writer: self.sink.open(&name).await?,
                    name,
                    digest: Sha256::new(),
                    record_bytes: 0,
                    records: 0,
                    total_bytes: 0,
                };
                let header = self.transformer.header()?;
                if !header.is_empty() {
                    chunk.emit(&header).await?;
                }
                open = Some(chunk);
            }
            let Some(chunk) = open.as_mut() else {
                return Err(Error::fatal("no open chunk"));
            };

            chunk.emit(&data).await?;
            chunk.record_bytes += data.len() as u64;
            chunk.records += 1;
            out.records += 1;

            if self.should_rotate(chunk) {
                if let Some(chunk) = open.take() {
                    let info = finish_chunk(chunk, self.transformer.as_ref()).await?;
                    out.bytes += info.bytes;
                    out.chunks.push(info);
                }
            }
        }

        if let Some(chunk) = open.take() {
            let info = finish_chunk(chunk, self.transformer.as_ref()).await?;
            out.bytes += info.bytes;
            out.chunks.push(info);
        }
        Ok(out)
    }
}

impl OpenChunk {
    async fn emit(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await?;
        self.digest.update(data);
        self.total_bytes += data.len() as u64;
        Ok(())
    }
}

async fn finish_chunk(mut chunk: OpenChunk, transformer: &dyn Transformer) -> Result<ChunkInfo> {
    let footer = transformer.footer()?;
    if !footer.is_empty() {
        chunk.emit(&footer).await?;
    }
    chunk.writer.close().await?;
    debug!(chunk = %chunk.name, records = chunk.records, "closed chunk");
    Ok(ChunkInfo {
        name: chunk.name,
        bytes: chunk.total_bytes,
        records: chunk.records,
        sha256: hex::encode(chunk.digest.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Record;
    use async_trait::async_trait;
    use std::sync::Mutex;

    // Mock implementations for testing

    #[derive(Clone, Default)]
    struct CaptureSink {
        chunks: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl CaptureSink {
        fn taken(&self) -> Vec<(String, Vec<u8>)> {
            self.chunks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for CaptureSink {
        async fn open(&self, name: &str) -> Result<Box<dyn SinkWriter>> {
            Ok(Box::new(CaptureWriter {
                name: name.to_string(),
                buf: Vec::new(),
                chunks: self.chunks.clone(),
            }))
        }
    }

    struct CaptureWriter {
        name: String,
        buf: Vec<u8>,
        chunks: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl SinkWriter for CaptureWriter {
        async fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.buf.extend_from_slice(buf);
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.chunks.lock().unwrap().push((self.name, self.buf));
            Ok(())
        }
    }

    struct ValExtractor;

    impl Extractor for ValExtractor {
        fn extract(&self, entry: &LogEntry) -> Result<Record> {
            let mut record = Record::new();
            record.insert("val".into(), entry.leaf_input.clone().into());
            Ok(record)
        }
    }

    struct LineTransformer;

    impl Transformer for LineTransformer {
        fn transform(&self, record: &Record) -> Result<Vec<u8>> {
            let val = record["val"].as_str().unwrap_or_default();
            Ok(format!("{val}\n").into_bytes())
        }
    }

    fn entries_channel(values: &[&str]) -> mpsc::Receiver<Result<LogEntry>> {
        let (tx, rx) = mpsc::channel(16);
        for (i, val) in values.iter().enumerate() {
            tx.try_send(Ok(LogEntry {
                index: i as u64,
                leaf_input: val.to_string(),
                extra_data: String::new(),
            }))
            .unwrap();
        }
        rx
    }

    fn pipeline(sink: CaptureSink, chunk_bytes: u64, chunk_records: u64) -> Pipeline {
        Pipeline::new(
            Arc::new(ValExtractor),
            Box::new(LineTransformer),
            Box::new(sink),
            "batch",
            chunk_bytes,
            chunk_records,
        )
    }

    async fn run(
        values: &[&str],
        chunk_bytes: u64,
        chunk_records: u64,
    ) -> (PipelineOutput, Vec<(String, Vec<u8>)>) {
        let sink = CaptureSink::default();
        let p = pipeline(sink.clone(), chunk_bytes, chunk_records);
        let cancel = CancellationToken::new();
        let mut entries = entries_channel(values);
        let out = p.stream_process(&cancel, &mut entries).await.unwrap();
        (out, sink.taken())
    }

    #[tokio::test]
    async fn rotates_by_record_count() {
        let (out, chunks) = run(&["0", "1", "2", "3", "4"], 0, 2).await;
        assert_eq!(out.records, 5);
        let names: Vec<&str> = chunks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["batch.0001", "batch.0002", "batch.0003"]);
        assert_eq!(chunks[0].1, b"0\n1\n");
        assert_eq!(chunks[1].1, b"2\n3\n");
        assert_eq!(chunks[2].1, b"4\n");
    }

    #[tokio::test]
    async fn rotates_by_bytes() {
        let (_, chunks) = run(&["0", "1", "2", "3"], 4, 0).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1, b"0\n1\n");
        assert_eq!(chunks[1].1, b"2\n3\n");
    }

    #[tokio::test]
    async fn first_limit_to_fire_wins() {
        let (_, chunks) = run(&["0", "1", "2", "3", "4", "5", "6"], 6, 3).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].1, b"0\n1\n2\n");
        assert_eq!(chunks[1].1, b"3\n4\n5\n");
        assert_eq!(chunks[2].1, b"6\n");
    }

    #[tokio::test]
    async fn unbounded_chunk_keeps_bare_name() {
        let (out, chunks) = run(&["0", "1", "2"], 0, 0).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "batch");
        assert_eq!(chunks[0].1, b"0\n1\n2\n");
        assert_eq!(out.chunks[0].records, 3);
    }

    #[tokio::test]
    async fn manifest_totals_and_digests() {
        let (out, _) = run(&["0", "1", "2"], 0, 2).await;
        assert_eq!(out.chunks.len(), 2);
        assert_eq!(out.bytes, 6);
        let expected = hex::encode(Sha256::digest(b"0\n1\n"));
        assert_eq!(out.chunks[0].sha256, expected);
    }

    #[tokio::test]
    async fn transformer_error_aborts_stream() {
        struct FailingTransformer;
        impl Transformer for FailingTransformer {
            fn transform(&self, _: &Record) -> Result<Vec<u8>> {
                Err(Error::corrupt("boom"))
            }
        }

        let sink = CaptureSink::default();
        let p = Pipeline::new(
            Arc::new(ValExtractor),
            Box::new(FailingTransformer),
            Box::new(sink.clone()),
            "batch",
            0,
            0,
        );
        let cancel = CancellationToken::new();
        let mut entries = entries_channel(&["0"]);
        assert!(p.stream_process(&cancel, &mut entries).await.is_err());
        assert!(sink.taken().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let sink = CaptureSink::default();
        let p = pipeline(sink, 0, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_tx, mut entries) = mpsc::channel::<Result<LogEntry>>(1);
        let err = p.stream_process(&cancel, &mut entries).await.unwrap_err();
        assert!(err.is_transient());
    }
}
