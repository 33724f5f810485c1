//! ctsnarf — distributed CT log ingestion.
//!
//! One binary, several roles: run a worker node, submit and inspect
//! jobs, approve nodes into the cluster, and manage stored secrets.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ctsnarf_core::cluster::{JobSpec, OutputOptions, Registry, SPEC_VERSION};
use ctsnarf_core::kv::{EtcdKv, Kv, DEFAULT_PREFIX};
use ctsnarf_core::secrets::SecretStore;
use ctsnarf_core::worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "ctsnarf")]
#[command(about = "Distributed Certificate Transparency log ingestion")]
struct Cli {
    /// etcd endpoints, comma separated
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        default_value = "http://localhost:2379",
        global = true
    )]
    etcd: String,

    /// Key prefix for all cluster state
    #[arg(long, env = "CTSNARF_PREFIX", default_value = DEFAULT_PREFIX, global = true)]
    prefix: String,

    /// Path of this node's keypair file
    #[arg(
        long,
        env = "CTSNARF_KEY_PATH",
        default_value = "data/node-key.json",
        global = true
    )]
    key_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker node
    Worker {
        /// Worker ID; defaults to a generated one
        #[arg(short, long)]
        id: Option<String>,

        /// Poll period in milliseconds when no shard is available
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        /// Shard lease TTL in seconds
        #[arg(long, default_value_t = 60)]
        lease_ttl: u64,

        /// CT log fetch batch size
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
    },

    /// Submit an ingestion job
    Submit {
        /// CT log base URI
        #[arg(long)]
        log_uri: String,

        /// First leaf index
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// One past the last leaf index; defaults to the log's current size
        #[arg(long)]
        end: Option<u64>,

        #[arg(long, default_value = "raw")]
        extractor: String,

        #[arg(long, default_value = "jsonl")]
        transformer: String,

        /// Transformer option as key=value (JSON values accepted)
        #[arg(long = "transformer-option", value_name = "KEY=VALUE")]
        transformer_options: Vec<String>,

        #[arg(long, default_value = "stdout")]
        sink: String,

        /// Sink option as key=value (JSON values accepted)
        #[arg(long = "sink-option", value_name = "KEY=VALUE")]
        sink_options: Vec<String>,

        /// gzip, bzip2, zstd, or none
        #[arg(long, default_value = "")]
        compression: String,

        #[arg(long, default_value_t = 0)]
        chunk_bytes: u64,

        #[arg(long, default_value_t = 0)]
        chunk_records: u64,

        /// Target shard size in leaves
        #[arg(long, default_value_t = 0)]
        shard_size: u64,

        /// Desired initial shard count
        #[arg(long, default_value_t = 0)]
        shard_count: u64,
    },

    /// Show jobs, or one job's shards
    Status {
        job: Option<String>,
    },

    /// Cancel a job
    Cancel {
        job: String,
    },

    /// List live workers
    Workers,

    /// Generate a new cluster key and print it
    Keygen,

    /// List nodes waiting for approval
    Pending,

    /// Seal the cluster key to a pending node
    Approve {
        node_id: String,

        /// Cluster key, base64
        #[arg(long, env = "CTSNARF_CLUSTER_KEY")]
        cluster_key: String,
    },

    /// Manage stored secrets
    Secret {
        /// Cluster key, base64; without it the node must already be approved
        #[arg(long, env = "CTSNARF_CLUSTER_KEY")]
        cluster_key: Option<String>,

        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    Set { key: String, value: String },
    Get { key: String },
    Rm { key: String },
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let endpoints: Vec<String> = cli.etcd.split(',').map(str::to_string).collect();

    match cli.command {
        Commands::Worker {
            id,
            poll_ms,
            lease_ttl,
            batch_size,
        } => {
            let kv = connect(&endpoints).await?;
            let worker_id =
                id.unwrap_or_else(|| format!("worker-{}", uuid_suffix()));
            let mut config = WorkerConfig::new(worker_id, hostname());
            config.poll_period = Duration::from_millis(poll_ms);
            config.lease_ttl = Duration::from_secs(lease_ttl);
            config.batch_size = batch_size;

            let cancel = shutdown_token();
            let secrets = Arc::new(SecretStore::open(kv.clone(), &cli.key_path, &cli.prefix)?);
            info!(node_id = %secrets.node_id(), "bootstrapping secrets");
            secrets.register_and_wait(&cancel).await?;

            let registry = Arc::new(Registry::new(kv, &cli.prefix));
            Worker::new(registry, secrets, config).run(cancel).await?;
        }

        Commands::Submit {
            log_uri,
            start,
            end,
            extractor,
            transformer,
            transformer_options,
            sink,
            sink_options,
            compression,
            chunk_bytes,
            chunk_records,
            shard_size,
            shard_count,
        } => {
            let kv = connect(&endpoints).await?;
            let registry = Registry::new(kv, &cli.prefix);
            let spec = JobSpec {
                version: SPEC_VERSION,
                log_uri,
                start,
                end,
                output: OutputOptions {
                    extractor,
                    transformer,
                    transformer_options: parse_options(&transformer_options)?,
                    sink,
                    sink_options: parse_options(&sink_options)?,
                    compression,
                    chunk_bytes,
                    chunk_records,
                },
                shard_size,
                shard_count,
            };
            let job_id = registry.submit_job(spec).await?;
            println!("{job_id}");
        }

        Commands::Status { job } => {
            let kv = connect(&endpoints).await?;
            let registry = Registry::new(kv, &cli.prefix);
            match job {
                Some(job_id) => {
                    let info = registry.get_job(&job_id).await?;
                    println!("job {} [{}]  {}", info.id, info.state.state, info.spec.log_uri);
                    let statuses = registry.coordinator().shard_statuses(&job_id).await?;
                    for (shard_id, status) in statuses {
                        let state = if status.done {
                            "done"
                        } else if status.failed {
                            "failed"
                        } else {
                            "open"
                        };
                        let assignee = status.last_assignee.as_deref().unwrap_or("-");
                        println!(
                            "  shard {shard_id:>4}  {}  {state:<6}  last: {assignee}",
                            status.range
                        );
                        if let Some(err) = &status.last_error {
                            println!("             error: {err}");
                        }
                    }
                }
                None => {
                    for info in registry.list_jobs().await? {
                        println!(
                            "{}  [{}]  {}  [{}, {})",
                            info.id,
                            info.state.state,
                            info.spec.log_uri,
                            info.spec.start,
                            info.spec.end.unwrap_or(0),
                        );
                    }
                }
            }
        }

        Commands::Cancel { job } => {
            let kv = connect(&endpoints).await?;
            Registry::new(kv, &cli.prefix).cancel_job(&job).await?;
        }

        Commands::Workers => {
            let kv = connect(&endpoints).await?;
            for w in Registry::new(kv, &cli.prefix).list_workers().await? {
                println!(
                    "{}  {}  up since {}  last heartbeat {}",
                    w.id, w.host, w.started_at, w.last_heartbeat
                );
            }
        }

        Commands::Keygen => {
            let key = SecretStore::generate_cluster_key();
            println!("{}", BASE64.encode(key));
        }

        Commands::Pending => {
            let kv = connect(&endpoints).await?;
            let secrets = SecretStore::open(kv, &cli.key_path, &cli.prefix)?;
            for node_id in secrets.list_pending().await? {
                println!("{node_id}");
            }
        }

        Commands::Approve {
            node_id,
            cluster_key,
        } => {
            let kv = connect(&endpoints).await?;
            let secrets = SecretStore::open(kv, &cli.key_path, &cli.prefix)?;
            let key = BASE64
                .decode(cluster_key.trim())
                .context("cluster key is not valid base64")?;
            secrets.approve_node(&node_id, &key).await?;
        }

        Commands::Secret {
            cluster_key,
            action,
        } => {
            let kv = connect(&endpoints).await?;
            let secrets = SecretStore::open(kv, &cli.key_path, &cli.prefix)?;
            match cluster_key {
                Some(encoded) => {
                    let key: [u8; 32] = BASE64
                        .decode(encoded.trim())
                        .context("cluster key is not valid base64")?
                        .as_slice()
                        .try_into()
                        .context("cluster key must be 32 bytes")?;
                    secrets.set_cluster_key(key);
                }
                None => {
                    let cancel = shutdown_token();
                    secrets.register_and_wait(&cancel).await?;
                }
            }
            match action {
                SecretAction::Set { key, value } => {
                    secrets.set(&key, value.as_bytes()).await?;
                }
                SecretAction::Get { key } => {
                    let value = secrets.get(&key).await?;
                    println!("{}", String::from_utf8_lossy(&value));
                }
                SecretAction::Rm { key } => {
                    secrets.delete(&key).await?;
                }
                SecretAction::Ls { prefix } => {
                    for key in secrets.list(&prefix).await? {
                        println!("{key}");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn connect(endpoints: &[String]) -> Result<Arc<dyn Kv>> {
    let kv = EtcdKv::connect(endpoints)
        .await
        .context("connecting to etcd")?;
    Ok(Arc::new(kv))
}

/// Cancellation token wired to ctrl-c.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            child.cancel();
        }
    });
    token
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn uuid_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Parse repeated `key=value` flags into an options map. Values that
/// parse as JSON keep their type; everything else becomes a string.
fn parse_options(pairs: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("option {pair:?} is not key=value"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}
