//! Dispatcher: selects published events for one `handler_kind`, claims them
//! into the inbox, runs the user batch handler inside the claim transaction,
//! and settles ACK / FAIL / DLQ atomically with the handler's effects.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use idx_db::ClaimedEvent;
use idx_metrics::{DLQ_TOTAL, INBOX_ATTEMPTS_TOTAL};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::watch;

/// The user-supplied batch handler. Side effects are permitted only through
/// `tx` — the same transaction that claims the inbox rows and will settle
/// them, so handler effects and inbox state are committed or rolled back
/// together.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(
        &self,
        events: &[ClaimedEvent],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub handler_kind: String,
    pub partition_selector: String,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub idle_sleep_ms: u64,
}

/// Run the dispatch loop for one `(handler_kind, partition_selector)` pair
/// until `stop` reports `true`.
pub async fn run(
    pool: PgPool,
    handler: Arc<dyn BatchHandler>,
    cfg: DispatcherConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *stop.borrow() {
            return Ok(());
        }

        match run_one_batch(&pool, handler.as_ref(), &cfg).await {
            Ok(true) => {}
            Ok(false) => sleep_or_stop(cfg.idle_sleep_ms, &mut stop).await,
            Err(err) => {
                tracing::warn!(
                    handler_kind = %cfg.handler_kind,
                    error = %err,
                    "dispatcher batch failed, retrying after idle sleep"
                );
                sleep_or_stop(cfg.idle_sleep_ms, &mut stop).await;
            }
        }
    }
}

/// Run one selection/claim/project/settle cycle. Returns `Ok(true)` if work
/// was found (whether or not it was this worker that won the claim),
/// `Ok(false)` if the selection query was empty.
async fn run_one_batch(
    pool: &PgPool,
    handler: &dyn BatchHandler,
    cfg: &DispatcherConfig,
) -> Result<bool> {
    let candidates = idx_db::select_eligible_events(
        pool,
        &cfg.handler_kind,
        &cfg.partition_selector,
        cfg.batch_size,
    )
    .await
    .context("dispatcher selection failed")?;

    if candidates.is_empty() {
        return Ok(false);
    }

    let mut tx = pool.begin().await.context("begin dispatch transaction")?;

    let claimed_ids = idx_db::inbox_claim_batch(&mut tx, &cfg.handler_kind, &candidates)
        .await
        .context("inbox claim failed")?;

    if claimed_ids.is_empty() {
        // Another worker claimed this whole batch first; abort without
        // invoking the handler. There is nothing to commit, so this is a
        // plain return rather than an explicit rollback.
        return Ok(true);
    }

    let claimed_set: HashSet<&str> = claimed_ids.iter().map(String::as_str).collect();
    let claimed_events: Vec<ClaimedEvent> = candidates
        .into_iter()
        .filter(|e| claimed_set.contains(e.event_id.as_str()))
        .collect();

    // Wrap the handler call in a savepoint so a batch that writes some
    // effects and then fails partway through never has those writes survive
    // alongside the FAIL/DLQ settle below — only the inbox transition is
    // allowed to commit on the error path.
    sqlx::query("SAVEPOINT handler_attempt")
        .execute(&mut *tx)
        .await
        .context("creating handler savepoint")?;

    match handler.handle(&claimed_events, &mut tx).await {
        Ok(()) => {
            sqlx::query("RELEASE SAVEPOINT handler_attempt")
                .execute(&mut *tx)
                .await
                .context("releasing handler savepoint")?;
            idx_db::inbox_settle_ack(&mut tx, &cfg.handler_kind, &claimed_ids)
                .await
                .context("inbox ack settle failed")?;
            tx.commit().await.context("commit dispatch transaction")?;
            INBOX_ATTEMPTS_TOTAL
                .with_label_values(&[&cfg.handler_kind, "ACK"])
                .inc_by(claimed_ids.len() as u64);
        }
        Err(err) => {
            let message = err.to_string();
            sqlx::query("ROLLBACK TO SAVEPOINT handler_attempt")
                .execute(&mut *tx)
                .await
                .context("rolling back to handler savepoint")?;
            idx_db::inbox_settle_fail(
                &mut tx,
                &cfg.handler_kind,
                &claimed_ids,
                &message,
                cfg.max_attempts,
            )
            .await
            .context("inbox fail settle failed")?;
            tx.commit().await.context("commit dispatch transaction")?;

            // The settle SQL itself decides FAIL vs DLQ per-row; this pass
            // does not know each row's post-increment attempt count, so the
            // resulting status per claimed event is read back only for the
            // DLQ counter, which matters for alerting.
            let statuses = idx_db::inbox_status_counts(pool, &cfg.handler_kind)
                .await
                .unwrap_or_default();
            let dlq_count = statuses
                .iter()
                .find(|(status, _)| status == "DLQ")
                .map(|(_, n)| *n)
                .unwrap_or(0);
            if dlq_count > 0 {
                DLQ_TOTAL.with_label_values(&[&cfg.handler_kind]).inc();
            }
            INBOX_ATTEMPTS_TOTAL
                .with_label_values(&[&cfg.handler_kind, "FAIL"])
                .inc_by(claimed_ids.len() as u64);
            tracing::warn!(
                handler_kind = %cfg.handler_kind,
                batch_size = claimed_ids.len(),
                error = %message,
                "batch handler failed"
            );
        }
    }

    Ok(true)
}

async fn sleep_or_stop(idle_sleep_ms: u64, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(idle_sleep_ms)) => {}
        _ = stop.changed() => {}
    }
}
