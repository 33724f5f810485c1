//! HTTP POST sink.
//!
//! The whole chunk is buffered in memory so a failed delivery can be
//! retried; retries cover transport errors and 5xx responses with a
//! linear backoff, while any 4xx is terminal.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::compress::{self, Algo};
use crate::error::{Error, Result};

use super::{compression_from, opt_u64, req_str, Sink, SinkOptions, SinkWriter};

const CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const RETRY_STEP: std::time::Duration = std::time::Duration::from_millis(200);
const DEFAULT_MAX_RETRIES: u64 = 3;

pub struct HttpSink {
    endpoint: String,
    headers: Vec<(String, String)>,
    compression: Algo,
    max_retries: u32,
    http: reqwest::Client,
}

impl HttpSink {
    pub fn from_options(opts: &SinkOptions) -> Result<Self> {
        let headers = match opts.get("headers") {
            None => Vec::new(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|s| (k.clone(), s.to_string()))
                        .ok_or_else(|| Error::validation("http sink headers must be strings"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(Error::validation("http sink headers must be a map"));
            }
        };
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| Error::fatal(format!("building http client: {e}")))?;
        Ok(Self {
            endpoint: req_str(opts, "endpoint")?,
            headers,
            compression: compression_from(opts)?,
            max_retries: opt_u64(opts, "max_retries", DEFAULT_MAX_RETRIES) as u32,
            http,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn open(&self, name: &str) -> Result<Box<dyn SinkWriter>> {
        Ok(Box::new(HttpWriter {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            compression: self.compression,
            max_retries: self.max_retries.max(1),
            chunk: name.to_string(),
            writer: Some(compress_writer(self.compression)?),
        }))
    }
}

type SharedBuf = std::sync::Arc<std::sync::Mutex<Vec<u8>>>;

fn compress_writer(
    algo: Algo,
) -> Result<(Box<dyn compress::CompressWrite>, SharedBuf)> {
    let shared: SharedBuf = Default::default();
    let sink = SharedBufWriter(shared.clone());
    Ok((compress::writer(sink, algo)?, shared))
}

struct SharedBufWriter(SharedBuf);

impl std::io::Write for SharedBufWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct HttpWriter {
    http: reqwest::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
    compression: Algo,
    max_retries: u32,
    chunk: String,
    writer: Option<(Box<dyn compress::CompressWrite>, SharedBuf)>,
}

#[async_trait]
impl SinkWriter for HttpWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        let (writer, _) = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::fatal("write after close"))?;
        writer.write_all(buf)?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let (writer, shared) = self
            .writer
            .take()
            .ok_or_else(|| Error::fatal("double close"))?;
        writer.finish()?;
        let body = std::mem::take(&mut *shared.lock().unwrap());

        let mut last_err = String::new();
        for attempt in 1..=self.max_retries {
            let mut req = self.http.post(&self.endpoint).body(body.clone());
            for (name, value) in &self.headers {
                req = req.header(name, value);
            }
            if let Some(encoding) = self.compression.content_encoding() {
                req = req.header(reqwest::header::CONTENT_ENCODING, encoding);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(chunk = %self.chunk, bytes = body.len(), "posted chunk");
                        return Ok(());
                    }
                    if status.is_client_error() {
                        return Err(Error::fatal(format!(
                            "http sink {}: {status}",
                            self.endpoint
                        )));
                    }
                    last_err = format!("{status}");
                }
                Err(err) => last_err = err.to_string(),
            }
            warn!(
                chunk = %self.chunk,
                attempt,
                error = %last_err,
                "chunk delivery failed"
            );
            tokio::time::sleep(RETRY_STEP * attempt).await;
        }
        Err(Error::transient(format!(
            "http sink {} failed after {} attempts: {last_err}",
            self.endpoint, self.max_retries
        )))
    }
}
