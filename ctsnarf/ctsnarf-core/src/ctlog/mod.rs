//! Certificate Transparency v1 log client.
//!
//! Speaks just enough of RFC 6962 for ingestion: `get-sth` to size a
//! job, `get-entries` to pull leaf batches. Logs routinely truncate
//! `get-entries` responses, so the batch fetcher keeps re-requesting
//! from wherever the previous response stopped.

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::ShardRange;
use crate::error::{Error, Result};

const CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// One CT log entry as returned by `get-entries`, paired with its
/// absolute leaf index. The payloads stay base64 as the log sent them;
/// extractors decide how far to decode.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub leaf_input: String,
    pub extra_data: String,
}

#[derive(Debug, Deserialize)]
struct SthResponse {
    tree_size: u64,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    leaf_input: String,
    extra_data: String,
}

#[derive(Debug, Deserialize)]
struct GetEntriesResponse {
    entries: Vec<RawEntry>,
}

#[derive(Clone)]
pub struct CtLogClient {
    http: reqwest::Client,
    base: String,
}

impl CtLogClient {
    pub fn new(base_uri: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| Error::fatal(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            base: base_uri.trim_end_matches('/').to_string(),
        })
    }

    /// Current tree size from the log's signed tree head.
    pub async fn tree_size(&self) -> Result<u64> {
        let url = format!("{}/ct/v1/get-sth", self.base);
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp, &url)?;
        let sth: SthResponse = resp.json().await?;
        Ok(sth.tree_size)
    }

    /// Fetch entries `[start, end]` (inclusive, per RFC 6962). The log
    /// may return fewer; the caller advances by what it got.
    pub async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>> {
        let url = format!("{}/ct/v1/get-entries?start={start}&end={end}", self.base);
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp, &url)?;
        let body: GetEntriesResponse = resp.json().await?;
        if body.entries.is_empty() {
            return Err(Error::transient(format!(
                "log returned no entries for [{start}, {end}]"
            )));
        }
        Ok(body
            .entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| LogEntry {
                index: start + i as u64,
                leaf_input: e.leaf_input,
                extra_data: e.extra_data,
            })
            .collect())
    }

    /// Stream a shard's range through a bounded channel.
    ///
    /// A fetch task pulls batches of up to `batch_size` and pushes
    /// individual entries; channel depth provides the backpressure.
    /// The first error (or cancellation) ends the stream.
    pub fn spawn_entry_stream(
        &self,
        range: ShardRange,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<LogEntry>> {
        let (tx, rx) = mpsc::channel(batch_size.max(1));
        let client = self.clone();
        tokio::spawn(async move {
            let mut next = range.lo;
            while next < range.hi {
                let end = (next + batch_size as u64).min(range.hi) - 1;
                let entries = tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = client.get_entries(next, end) => res,
                };
                match entries {
                    Ok(entries) => {
                        debug!(
                            start = next,
                            got = entries.len(),
                            asked = end - next + 1,
                            "fetched entries"
                        );
                        next += entries.len() as u64;
                        for entry in entries {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = tx.send(Ok(entry)) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(start = next, error = %err, "entry fetch failed");
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });
        rx
    }
}

fn check_status(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status.is_server_error() {
        Err(Error::transient(format!("{url}: {status}")))
    } else {
        Err(Error::fatal(format!("{url}: {status}")))
    }
}
