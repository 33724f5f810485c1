//! Worker node: the acquire → stream → report loop.
//!
//! A worker heartbeats its registration, polls for an open shard,
//! streams it through the ETL pipeline while a background task renews
//! the assignment lease, then reports the outcome. Losing the lease
//! mid-shard means another worker will pick the shard up, so the loser
//! abandons silently instead of reporting.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{
    AcquiredShard, JobInfo, JobState, Registry, ShardManifest, WorkerHandle, DEFAULT_LEASE_TTL,
};
use crate::ctlog::CtLogClient;
use crate::error::Result;
use crate::extract::ExtractorRegistry;
use crate::pipeline::Pipeline;
use crate::secrets::SecretStore;
use crate::sink::SinkRegistry;
use crate::transform::TransformerRegistry;

/// Consecutive renewal failures before the shard task is cancelled.
const RENEW_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: String,
    pub host: String,
    /// Sleep between acquisition attempts when no shard is available.
    pub poll_period: Duration,
    /// CT log fetch batch size (and entry channel depth).
    pub batch_size: usize,
    pub lease_ttl: Duration,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            poll_period: Duration::from_secs(1),
            batch_size: 256,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }
}

pub struct Worker {
    registry: Arc<Registry>,
    secrets: Arc<SecretStore>,
    sinks: SinkRegistry,
    extractors: ExtractorRegistry,
    transformers: TransformerRegistry,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(registry: Arc<Registry>, secrets: Arc<SecretStore>, config: WorkerConfig) -> Self {
        Self {
            registry,
            secrets,
            sinks: SinkRegistry::builtin(),
            extractors: ExtractorRegistry::builtin(),
            transformers: TransformerRegistry::builtin(),
            config,
        }
    }

    /// Replace the built-in registries, e.g. to add custom plugins.
    pub fn with_registries(
        mut self,
        sinks: SinkRegistry,
        extractors: ExtractorRegistry,
        transformers: TransformerRegistry,
    ) -> Self {
        self.sinks = sinks;
        self.extractors = extractors;
        self.transformers = transformers;
        self
    }

    /// Run until `cancel` fires. Per-shard errors are reported and
    /// logged; they never take the worker down.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut handle = self
            .registry
            .register_worker(&self.config.id, &self.config.host)
            .await?;
        info!(worker_id = %self.config.id, "worker started");

        while !cancel.is_cancelled() {
            handle = self.heartbeat(handle).await?;

            match self.acquire_any(&cancel).await {
                Ok(Some((job, acquired))) => {
                    self.run_shard(&cancel, &job, acquired).await;
                    continue;
                }
                Ok(None) => {}
                Err(err) if err.is_transient() || err.is_conflict() => {
                    warn!(error = %err, "acquisition attempt failed");
                }
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(self.config.poll_period)) => {}
            }
        }
        info!(worker_id = %self.config.id, "worker stopped");
        Ok(())
    }

    async fn heartbeat(&self, handle: WorkerHandle) -> Result<WorkerHandle> {
        match self.registry.heartbeat_worker(&handle).await {
            Ok(()) => Ok(handle),
            Err(err) if err.is_lease_lost() => {
                warn!(worker_id = %self.config.id, "heartbeat lease expired, re-registering");
                self.registry
                    .register_worker(&self.config.id, &self.config.host)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Scan running jobs for an acquirable shard.
    async fn acquire_any(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(JobInfo, AcquiredShard)>> {
        let jobs = self.registry.list_jobs().await?;
        for job in jobs {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if job.state.state != JobState::Running {
                continue;
            }
            if self.registry.is_job_cancelled(&job.id).await? {
                continue;
            }
            if let Some(acquired) = self
                .registry
                .coordinator()
                .try_acquire_shard(&job.id, &self.config.id, self.config.lease_ttl)
                .await?
            {
                return Ok(Some((job, acquired)));
            }
        }
        Ok(None)
    }

    /// Process one acquired shard end to end.
    async fn run_shard(&self, cancel: &CancellationToken, job: &JobInfo, acquired: AcquiredShard) {
        let shard_token = cancel.child_token();
        let renewer = self.spawn_renewer(&acquired, shard_token.clone());

        let result = self.stream_shard(&shard_token, job, &acquired).await;

        renewer.abort();
        match result {
            Ok(manifest) => {
                match self
                    .registry
                    .coordinator()
                    .report_shard_done(&acquired, &manifest)
                    .await
                {
                    Ok(()) => {
                        if let Ok(true) = self.registry.coordinator().job_complete(&job.id).await {
                            if let Err(err) = self.registry.mark_job_completed(&job.id).await {
                                debug!(job_id = %job.id, error = %err, "completion race");
                            }
                        }
                    }
                    Err(err) if err.is_lease_lost() => {
                        warn!(
                            job_id = %job.id,
                            shard_id = acquired.shard_id,
                            "lost assignment before reporting; abandoning shard"
                        );
                    }
                    Err(err) => {
                        error!(
                            job_id = %job.id,
                            shard_id = acquired.shard_id,
                            error = %err,
                            "failed to report shard completion"
                        );
                    }
                }
            }
            Err(err) if shard_token.is_cancelled() || err.is_lease_lost() => {
                // Either our lease renewal gave out or the worker is
                // shutting down. Another worker will pick the shard up.
                warn!(
                    job_id = %job.id,
                    shard_id = acquired.shard_id,
                    error = %err,
                    "abandoning shard"
                );
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    shard_id = acquired.shard_id,
                    error = %err,
                    "shard failed"
                );
                if let Err(report_err) = self
                    .registry
                    .coordinator()
                    .report_shard_failed(&acquired, &err.to_string())
                    .await
                {
                    warn!(
                        job_id = %job.id,
                        shard_id = acquired.shard_id,
                        error = %report_err,
                        "failed to report shard failure"
                    );
                }
            }
        }
        // Release the assignment lease; harmless if already gone.
        let _ = self.registry.kv().revoke_lease(acquired.lease_id).await;
    }

    /// Renew the assignment lease every `lease_ttl / 3`; after three
    /// consecutive failures, cancel the shard task.
    fn spawn_renewer(
        &self,
        acquired: &AcquiredShard,
        shard_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let acquired = acquired.clone();
        let interval = self.config.renew_interval();
        let lease_ttl = self.config.lease_ttl;
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = shard_token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match registry.coordinator().renew(&acquired, lease_ttl).await {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        warn!(
                            shard_id = acquired.shard_id,
                            failures,
                            error = %err,
                            "lease renewal failed"
                        );
                        if err.is_lease_lost() || failures >= RENEW_FAILURE_LIMIT {
                            shard_token.cancel();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Build the pipeline described by the job spec and stream the
    /// shard's range through it.
    async fn stream_shard(
        &self,
        shard_token: &CancellationToken,
        job: &JobInfo,
        acquired: &AcquiredShard,
    ) -> Result<ShardManifest> {
        let output = &job.spec.output;
        let extractor = self.extractors.for_name(&output.extractor)?;
        let transformer = self
            .transformers
            .build(&output.transformer, &output.transformer_options)?;

        // The job-level compression option rides into the sink unless
        // the sink options already pin one.
        let mut sink_options = output.sink_options.clone();
        if !output.compression.is_empty() && !sink_options.contains_key("compression") {
            sink_options.insert("compression".into(), output.compression.clone().into());
        }
        let sink = self
            .sinks
            .build(&output.sink, &sink_options, self.secrets.clone())?;

        let base_name = format!(
            "{}/{:012}-{:012}",
            job.id, acquired.range.lo, acquired.range.hi
        );
        let pipeline = Pipeline::new(
            extractor,
            transformer,
            sink,
            base_name,
            output.chunk_bytes,
            output.chunk_records,
        );

        let client = CtLogClient::new(&job.spec.log_uri)?;
        let mut entries =
            client.spawn_entry_stream(acquired.range, self.config.batch_size, shard_token.clone());

        info!(
            job_id = %job.id,
            shard_id = acquired.shard_id,
            range = %acquired.range,
            "processing shard"
        );
        let out = pipeline.stream_process(shard_token, &mut entries).await?;

        Ok(ShardManifest {
            shard_id: acquired.shard_id,
            range: acquired.range,
            records: out.records,
            bytes: out.bytes,
            chunks: out.chunks,
        })
    }
}

/// ±20% jitter to spread polling across the fleet.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(800));
            assert!(d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn renew_interval_is_a_third_of_ttl() {
        let config = WorkerConfig::new("w", "h");
        assert_eq!(config.renew_interval(), DEFAULT_LEASE_TTL / 3);
    }
}
