//! Ingest outbox publisher: pushes each persisted event to a transport sink
//! exactly once, stamping `published_at` on return regardless of outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;

/// The transport sink an implementer supplies. `on_publish` is called once
/// per outbox row; its result does not gate the `published_at` stamp — see
/// the module-level rationale in the design notes this crate implements.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn on_publish(&self, event_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: i64,
    pub idle_sleep_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            idle_sleep_ms: 250,
        }
    }
}

/// Run the publish loop until `stop` reports `true`.
pub async fn run(
    pool: PgPool,
    sink: Arc<dyn PublishSink>,
    cfg: PublisherConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *stop.borrow() {
            return Ok(());
        }

        let backlog = idx_db::outbox_count_unpublished(&pool)
            .await
            .context("publisher backlog query failed")?;
        tracing::debug!(backlog, "outbox publisher backlog");

        let event_ids = idx_db::outbox_select_unpublished(&pool, cfg.batch_size)
            .await
            .context("publisher select failed")?;

        if event_ids.is_empty() {
            sleep_or_stop(cfg.idle_sleep_ms, &mut stop).await;
            continue;
        }

        for event_id in event_ids {
            if let Err(err) = sink.on_publish(&event_id).await {
                tracing::warn!(event_id = %event_id, error = %err, "on_publish failed, stamping anyway");
            }
            idx_db::outbox_mark_published(&pool, &event_id)
                .await
                .context("publisher stamp failed")?;
        }
    }
}

async fn sleep_or_stop(idle_sleep_ms: u64, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(idle_sleep_ms)) => {}
        _ = stop.changed() => {}
    }
}
