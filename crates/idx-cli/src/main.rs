//! idx-cli entry point.
//!
//! Thin like the teacher's own CLI binary: parses one subcommand, wires the
//! concrete adapters (RPC client, handler registry, metrics server) the
//! chosen component needs, and hands off to that component's loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use idx_config::IndexerConfig;
use idx_dispatcher::BatchHandler;
use idx_rpc::{JsonRpcClient, PoolConfig, ReadClient, WriteClient};
use sqlx::PgPool;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "idx")]
#[command(about = "Polling-based chain log indexer control surface", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one component's loop in-process until SIGINT/SIGTERM.
    Run {
        #[command(subcommand)]
        role: RunRole,
    },
    /// Reset inbox rows for `[from, to]` back to PENDING for a handler kind.
    Replay {
        #[arg(long)]
        handler_kind: String,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
    },
    /// Reset FAIL (and, with --dlq, DLQ) rows for a handler kind back to PENDING.
    ResetFailed {
        #[arg(long)]
        handler_kind: String,
        #[arg(long)]
        dlq: bool,
    },
    /// Print head, cursors, outbox backlog, and inbox status counts.
    Status,
    /// Database maintenance commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum RunRole {
    Ingest,
    Publisher,
    Dispatch,
    Executor,
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run { role } => run_role(role).await,
        Commands::Replay {
            handler_kind,
            from,
            to,
        } => {
            let pool = idx_db::connect_from_env().await?;
            let (inserted, reset) = idx_db::inbox_reset_range(&pool, &handler_kind, from, to)
                .await
                .context("replay failed")?;
            println!("inserted={inserted} reset={reset}");
            Ok(())
        }
        Commands::ResetFailed { handler_kind, dlq } => {
            let pool = idx_db::connect_from_env().await?;
            let reset = idx_db::inbox_reset_failed(&pool, &handler_kind, dlq)
                .await
                .context("reset-failed failed")?;
            println!("reset={reset}");
            Ok(())
        }
        Commands::Status => status().await,
        Commands::Db { cmd } => {
            let pool = idx_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = idx_db::status(&pool).await?;
                    println!("db_ok={} has_core_tables={}", s.ok, s.has_core_tables);
                }
                DbCmd::Migrate => {
                    idx_db::migrate(&pool).await?;
                    idx_demo_erc20::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn pool_config(cfg: &IndexerConfig, rps_max: u32, burst: Option<f64>) -> PoolConfig {
    PoolConfig {
        rps_max: rps_max as f64,
        burst,
        failure_threshold: cfg.cb_failure_threshold,
        open_seconds: cfg.cb_open_seconds,
        head_timeout: Duration::from_millis(cfg.head_timeout_ms),
        get_logs_timeout: Duration::from_millis(cfg.get_logs_timeout_ms),
        send_tx_timeout: Duration::from_millis(cfg.send_tx_timeout_ms),
    }
}

fn read_client(cfg: &IndexerConfig) -> JsonRpcClient {
    JsonRpcClient::new(
        cfg.rpc_read_url.clone(),
        pool_config(cfg, cfg.rps_max_read, cfg.burst_read),
        "read",
    )
}

fn write_client(cfg: &IndexerConfig) -> JsonRpcClient {
    JsonRpcClient::new(
        cfg.rpc_write_url.clone(),
        pool_config(cfg, cfg.rps_max_write, cfg.burst_write),
        "write",
    )
}

/// Registered `handler_kind -> BatchHandler` pairs. Unknown `handler_kind` at
/// `run dispatch` startup is a fatal configuration error.
fn handler_registry() -> HashMap<String, Arc<dyn BatchHandler>> {
    let mut registry: HashMap<String, Arc<dyn BatchHandler>> = HashMap::new();
    registry.insert(
        idx_demo_erc20::HANDLER_KIND.to_string(),
        Arc::new(idx_demo_erc20::Erc20TransferProjector {
            token: "demo".to_string(),
        }),
    );
    registry
}

struct LoggingPublishSink;

#[async_trait::async_trait]
impl idx_publisher::PublishSink for LoggingPublishSink {
    async fn on_publish(&self, event_id: &str) -> Result<()> {
        tracing::debug!(event_id, "publishing ingest event");
        Ok(())
    }
}

struct RawTxSubmitter {
    write: Arc<dyn WriteClient>,
}

#[async_trait::async_trait]
impl idx_executor::CommandSubmitter for RawTxSubmitter {
    async fn submit(&self, row: &idx_db::DomainOutboxRow) -> Result<String> {
        let raw_tx = row
            .payload
            .get("raw_tx")
            .and_then(|v| v.as_str())
            .with_context(|| format!("domain command {} is missing a raw_tx payload field", row.command_key))?;
        self.write
            .send_raw_transaction(raw_tx)
            .await
            .map_err(Into::into)
    }
}

/// Flips the returned sender to `true` on SIGINT/SIGTERM so every component
/// loop exits at its next suspension point rather than mid-transaction.
fn spawn_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received, draining in-flight work");
        let _ = tx.send(true);
    });
    rx
}

async fn run_role(role: RunRole) -> Result<()> {
    let cfg = IndexerConfig::parse();
    idx_metrics::init();

    let metrics_addr: SocketAddr = cfg
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid INDEXER_METRICS_ADDR: {}", cfg.metrics_addr))?;
    let service_name: &'static str = match role {
        RunRole::Ingest => "idx-scanner",
        RunRole::Publisher => "idx-publisher",
        RunRole::Dispatch => "idx-dispatcher",
        RunRole::Executor => "idx-executor",
    };
    let _metrics_server = tokio::spawn(idx_metrics::serve(metrics_addr, service_name));

    let pool = idx_db::connect(&cfg.database_url).await?;
    let stop = spawn_shutdown_signal();

    match role {
        RunRole::Ingest => {
            let read: Arc<dyn ReadClient> = Arc::new(read_client(&cfg));
            let scanner_cfg = idx_scanner::ScannerConfig {
                shard_id: cfg.shard_id.clone(),
                poll_interval_ms: cfg.poll_interval_ms,
                step_init: cfg.step_init,
                step_min: cfg.step_min,
                step_max: cfg.step_max,
                address_shards: cfg.address_shards,
                subscriptions: cfg.subscriptions()?,
            };
            idx_scanner::run(read, pool, scanner_cfg, stop).await
        }
        RunRole::Publisher => {
            let sink = Arc::new(LoggingPublishSink);
            let publisher_cfg = idx_publisher::PublisherConfig {
                batch_size: cfg.publish_batch_size,
                idle_sleep_ms: cfg.poll_interval_ms,
            };
            idx_publisher::run(pool, sink, publisher_cfg, stop).await
        }
        RunRole::Dispatch => {
            if cfg.handler_kind.is_empty() {
                bail!("INDEXER_HANDLER_KIND is required for `run dispatch`");
            }
            let registry = handler_registry();
            let handler = registry
                .get(&cfg.handler_kind)
                .with_context(|| format!("unknown handler_kind: {}", cfg.handler_kind))?
                .clone();
            let dispatcher_cfg = idx_dispatcher::DispatcherConfig {
                handler_kind: cfg.handler_kind.clone(),
                partition_selector: cfg.partition_selector.clone(),
                batch_size: cfg.dispatch_batch_size,
                max_attempts: cfg.max_attempts,
                idle_sleep_ms: cfg.poll_interval_ms,
            };
            idx_dispatcher::run(pool, handler, dispatcher_cfg, stop).await
        }
        RunRole::Executor => {
            let write: Arc<dyn WriteClient> = Arc::new(write_client(&cfg));
            let submitter = Arc::new(RawTxSubmitter { write });
            let executor_cfg = idx_executor::ExecutorConfig {
                batch_size: cfg.executor_batch_size,
                idle_sleep_ms: cfg.poll_interval_ms,
                enabled: cfg.executor_enabled,
            };
            idx_executor::run(pool, submitter, executor_cfg, stop).await
        }
    }
}

async fn status() -> Result<()> {
    let cfg = IndexerConfig::parse();
    let pool: PgPool = idx_db::connect(&cfg.database_url).await?;

    let read = read_client(&cfg);
    match read.get_head_block().await {
        Ok(head) => println!("head={head}"),
        Err(err) => println!("head=unavailable ({err})"),
    }

    let snapshot = idx_db::status_snapshot(&pool).await?;
    for (shard, last_processed_block) in &snapshot.cursors {
        println!("cursor[{shard}]={last_processed_block}");
    }
    println!("pending_ingest_outbox={}", snapshot.pending_ingest_outbox);
    println!("pending_domain_outbox={}", snapshot.pending_domain_outbox);

    for handler_kind in handler_registry().keys() {
        let counts = idx_db::inbox_status_counts(&pool, handler_kind).await?;
        for (status, n) in counts {
            println!("inbox[{handler_kind}][{status}]={n}");
        }
    }

    Ok(())
}
