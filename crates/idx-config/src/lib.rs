//! Environment-driven configuration for every indexer component.
//!
//! `IndexerConfig` is the single source of truth for the environment inputs
//! enumerated by the system design. It is a `clap::Parser` derive so the CLI
//! and a bare `IndexerConfig::parse()` share one definition: required fields
//! with no default (RPC URLs, the database URL) fail to parse with a
//! readable error instead of panicking deep inside a loop.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// One `{address?, topic0?}` log subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub address: Option<String>,
    pub topic0: Option<String>,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "indexer-config")]
pub struct IndexerConfig {
    /// JSON-RPC URL used for all reads (head poll, get_logs).
    #[arg(long, env = "INDEXER_RPC_READ_URL")]
    pub rpc_read_url: String,

    /// JSON-RPC URL used for raw transaction submission.
    #[arg(long, env = "INDEXER_RPC_WRITE_URL")]
    pub rpc_write_url: String,

    /// PostgreSQL connection string.
    #[arg(long, env = "INDEXER_DATABASE_URL")]
    pub database_url: String,

    /// Sleep between poll iterations when a loop finds no work.
    #[arg(long, env = "INDEXER_POLL_INTERVAL_MS", default_value_t = 300)]
    pub poll_interval_ms: u64,

    /// Initial scanner block-range width.
    #[arg(long, env = "INDEXER_STEP_INIT", default_value_t = 1_000)]
    pub step_init: u64,

    /// Scanner block-range width floor.
    #[arg(long, env = "INDEXER_STEP_MIN", default_value_t = 1)]
    pub step_min: u64,

    /// Scanner block-range width ceiling.
    #[arg(long, env = "INDEXER_STEP_MAX", default_value_t = 20_000)]
    pub step_max: u64,

    /// Token-bucket refill rate for the read pool, in requests/second.
    #[arg(long, env = "INDEXER_RPS_MAX_READ", default_value_t = 20)]
    pub rps_max_read: u32,

    /// Token-bucket refill rate for the write pool, in requests/second.
    #[arg(long, env = "INDEXER_RPS_MAX_WRITE", default_value_t = 5)]
    pub rps_max_write: u32,

    /// Number of address shards; `partition_key` is prefixed by `shard mod this`.
    #[arg(long, env = "INDEXER_ADDRESS_SHARDS", default_value_t = 1)]
    pub address_shards: u32,

    /// Token-bucket burst capacity for the read pool. Defaults to `rps_max_read`.
    #[arg(long, env = "INDEXER_BURST_READ")]
    pub burst_read: Option<f64>,

    /// Token-bucket burst capacity for the write pool. Defaults to `rps_max_write`.
    #[arg(long, env = "INDEXER_BURST_WRITE")]
    pub burst_write: Option<f64>,

    /// Consecutive failures before a pool's circuit breaker opens.
    #[arg(long, env = "INDEXER_CB_FAILURE_THRESHOLD", default_value_t = 5)]
    pub cb_failure_threshold: u32,

    /// Seconds a tripped circuit breaker stays open before probing again.
    #[arg(long, env = "INDEXER_CB_OPEN_SECONDS", default_value_t = 30)]
    pub cb_open_seconds: u64,

    /// Per-call deadline for head-block fetches, in milliseconds.
    #[arg(long, env = "INDEXER_HEAD_TIMEOUT_MS", default_value_t = 2_000)]
    pub head_timeout_ms: u64,

    /// Per-call deadline for get_logs fetches, in milliseconds.
    #[arg(long, env = "INDEXER_GET_LOGS_TIMEOUT_MS", default_value_t = 5_000)]
    pub get_logs_timeout_ms: u64,

    /// Per-call deadline for raw transaction submission, in milliseconds.
    #[arg(long, env = "INDEXER_SEND_TX_TIMEOUT_MS", default_value_t = 5_000)]
    pub send_tx_timeout_ms: u64,

    /// Dispatcher batch size.
    #[arg(long, env = "INDEXER_DISPATCH_BATCH_SIZE", default_value_t = 200)]
    pub dispatch_batch_size: i64,

    /// Publisher batch size.
    #[arg(long, env = "INDEXER_PUBLISH_BATCH_SIZE", default_value_t = 500)]
    pub publish_batch_size: i64,

    /// Executor batch size.
    #[arg(long, env = "INDEXER_EXECUTOR_BATCH_SIZE", default_value_t = 100)]
    pub executor_batch_size: i64,

    /// Attempts before an inbox entry moves FAIL -> DLQ.
    #[arg(long, env = "INDEXER_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: i32,

    /// Whether the domain executor submits transactions at all. Handlers may
    /// still enqueue domain-outbox commands while this is false (draining).
    #[arg(long, env = "INDEXER_EXECUTOR_ENABLED", default_value_t = true)]
    pub executor_enabled: bool,

    /// JSON array of `{address?, topic0?}` subscriptions. Empty array means
    /// "one unfiltered range query."
    #[arg(long, env = "INDEXER_SUBSCRIPTIONS_JSON", default_value = "[]")]
    pub subscriptions_json: String,

    /// Cursor row id for this scanner shard, e.g. `"default:shard-0"`.
    #[arg(long, env = "INDEXER_SHARD_ID", default_value = "default:shard-0")]
    pub shard_id: String,

    /// Partition-key prefix a dispatcher worker is scoped to. Empty matches all.
    #[arg(long, env = "INDEXER_PARTITION_SELECTOR", default_value = "")]
    pub partition_selector: String,

    /// Handler kind a dispatcher worker runs. Required for `run dispatch`.
    #[arg(long, env = "INDEXER_HANDLER_KIND", default_value = "")]
    pub handler_kind: String,

    /// Bind address for the /metrics and /healthz server.
    #[arg(long, env = "INDEXER_METRICS_ADDR", default_value = "127.0.0.1:9898")]
    pub metrics_addr: String,
}

impl IndexerConfig {
    /// Parse `subscriptions_json` into concrete subscriptions.
    ///
    /// Called once at startup; a malformed payload is a configuration-fatal
    /// error, not a per-iteration one.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        serde_json::from_str(&self.subscriptions_json)
            .context("invalid INDEXER_SUBSCRIPTIONS_JSON: expected a JSON array of {address?, topic0?}")
    }
}
