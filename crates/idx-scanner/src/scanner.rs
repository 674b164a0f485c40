use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use idx_config::Subscription;
use idx_db::NewIngestEvent;
use idx_metrics::INDEXER_BACKLOG;
use idx_rpc::{LogFilter, ReadClient};
use sqlx::PgPool;
use tokio::sync::watch;

use crate::partition::{event_id, partition_key};

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub shard_id: String,
    pub poll_interval_ms: u64,
    pub step_init: u64,
    pub step_min: u64,
    pub step_max: u64,
    pub address_shards: u32,
    pub subscriptions: Vec<Subscription>,
}

/// Compute `[from, to]` for the next chunk, or `None` when there is nothing
/// new (`head <= hwm`). `hwm` is the cursor's current high-water mark, seeded
/// at `-1` so block `0` is always in range on a cold start.
pub fn compute_range(hwm: i64, head: u64, step: u64) -> Option<(u64, u64)> {
    let from = u64::try_from(hwm + 1).unwrap_or(0);
    if head < from {
        return None;
    }
    let to = head.min(from + step.max(1) - 1);
    Some((from, to))
}

fn build_filters(subscriptions: &[Subscription], from: u64, to: u64) -> Vec<LogFilter> {
    if subscriptions.is_empty() {
        return vec![LogFilter {
            address: None,
            topic0: None,
            from_block: from,
            to_block: to,
        }];
    }
    subscriptions
        .iter()
        .map(|sub| LogFilter {
            address: sub.address.clone(),
            topic0: sub.topic0.clone(),
            from_block: from,
            to_block: to,
        })
        .collect()
}

fn log_to_event(log: &idx_rpc::Log, address_shards: u32) -> Result<NewIngestEvent> {
    let payload =
        serde_json::to_value(log).context("serializing fetched log to ingest payload")?;
    Ok(NewIngestEvent {
        event_id: event_id(&log.block_hash, log.block_number, log.tx_index, log.log_index),
        block_number: log.block_number as i64,
        block_hash: log.block_hash.clone(),
        tx_index: log.tx_index as i64,
        log_index: log.log_index as i64,
        address: log.address.clone(),
        topic0: log.topics.first().cloned(),
        partition_key: partition_key(&log.address, address_shards),
        payload,
    })
}

enum Tick {
    NothingNew,
    Advanced { head: u64, to: u64, inserted: usize },
}

async fn tick(read: &dyn ReadClient, pool: &PgPool, cfg: &ScannerConfig, step: u64) -> Result<Tick> {
    let head = read.get_head_block().await.context("head fetch failed")?;
    let hwm = idx_db::cursor_get(pool, &cfg.shard_id)
        .await
        .context("cursor read failed")?;

    let Some((from, to)) = compute_range(hwm, head, step) else {
        return Ok(Tick::NothingNew);
    };

    let filters = build_filters(&cfg.subscriptions, from, to);
    let fetches = filters.iter().map(|filter| read.get_logs(filter));
    let log_batches = try_join_all(fetches).await.context("log fetch failed")?;

    let mut events = Vec::new();
    for batch in log_batches {
        for log in &batch {
            events.push(log_to_event(log, cfg.address_shards)?);
        }
    }

    let inserted = idx_db::cursor_advance_with_events(pool, &cfg.shard_id, &events, to as i64)
        .await
        .context("append transaction failed")?;

    Ok(Tick::Advanced { head, to, inserted })
}

/// Run this shard's scan loop until `stop` reports `true`. Returns `Ok(())`
/// on graceful stop; propagates only unrecoverable startup errors (RPC
/// fetch / DB transient errors are narrowed-and-retried in-loop, never
/// returned).
pub async fn run(
    read: Arc<dyn ReadClient>,
    pool: PgPool,
    cfg: ScannerConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut step = cfg.step_init.clamp(cfg.step_min, cfg.step_max);

    loop {
        if *stop.borrow() {
            return Ok(());
        }

        match tick(read.as_ref(), &pool, &cfg, step).await {
            Ok(Tick::Advanced { head, to, inserted: _ }) => {
                INDEXER_BACKLOG
                    .with_label_values(&[&cfg.shard_id])
                    .set(head.saturating_sub(to) as i64);
                step = (step * 2).min(cfg.step_max);
            }
            Ok(Tick::NothingNew) => {
                INDEXER_BACKLOG.with_label_values(&[&cfg.shard_id]).set(0);
                sleep_or_stop(cfg.poll_interval_ms, &mut stop).await;
            }
            Err(err) => {
                tracing::warn!(shard = %cfg.shard_id, error = %err, "scanner iteration failed, narrowing step");
                step = (step / 2).max(cfg.step_min);
                sleep_or_stop(cfg.poll_interval_ms, &mut stop).await;
            }
        }
    }
}

async fn sleep_or_stop(poll_interval_ms: u64, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(poll_interval_ms)) => {}
        _ = stop.changed() => {}
    }
}
