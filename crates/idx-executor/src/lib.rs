//! Domain executor: submits pending domain-outbox commands as on-chain
//! transactions exactly once per `command_key`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use idx_db::DomainOutboxRow;
use idx_metrics::DOMAIN_OUTBOX_UNPUBLISHED;
use sqlx::PgPool;
use tokio::sync::watch;

/// Submits one domain command as an on-chain transaction. Nonce, gas, and
/// signing are the implementer's concern; this core only needs a `tx_hash`
/// back on success or an error on failure.
#[async_trait]
pub trait CommandSubmitter: Send + Sync {
    async fn submit(&self, row: &DomainOutboxRow) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub batch_size: i64,
    pub idle_sleep_ms: u64,
    /// Disables submission attempts while handlers may still enqueue
    /// commands. Used to drain in-flight work before maintenance.
    pub enabled: bool,
}

pub async fn run(
    pool: PgPool,
    submitter: Arc<dyn CommandSubmitter>,
    cfg: ExecutorConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *stop.borrow() {
            return Ok(());
        }

        let pending = idx_db::domain_outbox_count_pending(&pool)
            .await
            .context("executor pending count failed")?;
        DOMAIN_OUTBOX_UNPUBLISHED.set(pending);

        if !cfg.enabled {
            sleep_or_stop(cfg.idle_sleep_ms, &mut stop).await;
            continue;
        }

        let rows = idx_db::domain_outbox_select_pending(&pool, cfg.batch_size)
            .await
            .context("executor selection failed")?;

        if rows.is_empty() {
            sleep_or_stop(cfg.idle_sleep_ms, &mut stop).await;
            continue;
        }

        for row in rows {
            match submitter.submit(&row).await {
                Ok(tx_hash) => {
                    let won = idx_db::domain_outbox_mark_published(&pool, &row.command_key, &tx_hash)
                        .await
                        .context("executor mark-published failed")?;
                    if !won {
                        tracing::debug!(
                            command_key = %row.command_key,
                            "another executor already submitted this command"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        command_key = %row.command_key,
                        kind = %row.kind,
                        error = %err,
                        "on-chain submission failed, will retry next poll"
                    );
                }
            }
        }
    }
}

async fn sleep_or_stop(idle_sleep_ms: u64, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(idle_sleep_ms)) => {}
        _ = stop.changed() => {}
    }
}
