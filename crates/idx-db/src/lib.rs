//! Storage layer for the indexer core.
//!
//! One `sqlx::PgPool` is shared by every component. Each function here is a
//! single typed accessor for one query named by the system design; SQL lives
//! inline next to the Rust it binds to, the way the teacher's db crate does
//! it, rather than behind an ORM.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};

pub const ENV_DB_URL: &str = "INDEXER_DATABASE_URL";

/// Connect to Postgres using an already-resolved connection string.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Connect using `INDEXER_DATABASE_URL`. Convenience for tests and small tools.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Connectivity + schema-presence check for the CLI's `db status`.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'infra' and table_name = 'cursors'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_core_tables: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_core_tables: bool,
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Read the current high-water mark for a shard, seeding the row at `-1`
/// (meaning "nothing processed yet") the first time it is seen. `-1` is used
/// rather than `0` so block `0` itself is always in range to ingest.
pub async fn cursor_get(pool: &PgPool, shard_id: &str) -> Result<i64> {
    sqlx::query(
        r#"
        insert into infra.cursors (id, last_processed_block)
        values ($1, -1)
        on conflict (id) do nothing
        "#,
    )
    .bind(shard_id)
    .execute(pool)
    .await
    .context("cursor seed failed")?;

    let (hwm,): (i64,) =
        sqlx::query_as("select last_processed_block from infra.cursors where id = $1")
            .bind(shard_id)
            .fetch_one(pool)
            .await
            .context("cursor_get failed")?;

    Ok(hwm)
}

/// A single log event as parsed off the wire, ready to persist.
#[derive(Debug, Clone)]
pub struct NewIngestEvent {
    pub event_id: String,
    pub block_number: i64,
    pub block_hash: String,
    pub tx_index: i64,
    pub log_index: i64,
    pub address: String,
    pub topic0: Option<String>,
    pub partition_key: String,
    pub payload: Value,
}

/// The scanner's one all-or-nothing append transaction (I3): insert every new
/// IngestEvent (conflict-ignored), a matching IngestOutbox row for each, then
/// advance the cursor to `to`. Returns the number of IngestEvent rows that
/// were newly inserted (duplicates across overlapping scans are not counted,
/// which is what makes Q1 observable from the return value in tests).
pub async fn cursor_advance_with_events(
    pool: &PgPool,
    shard_id: &str,
    events: &[NewIngestEvent],
    to: i64,
) -> Result<usize> {
    let mut tx = pool.begin().await.context("begin append transaction")?;

    let mut inserted = 0usize;
    for ev in events {
        let did_insert: bool = sqlx::query_scalar(
            r#"
            insert into infra.ingest_events (
                event_id, block_number, block_hash, tx_index, log_index,
                address, topic0, partition_key, payload
            )
            values ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            on conflict (event_id) do nothing
            returning true
            "#,
        )
        .bind(&ev.event_id)
        .bind(ev.block_number)
        .bind(&ev.block_hash)
        .bind(ev.tx_index)
        .bind(ev.log_index)
        .bind(&ev.address)
        .bind(&ev.topic0)
        .bind(&ev.partition_key)
        .bind(&ev.payload)
        .fetch_optional(&mut *tx)
        .await
        .context("ingest_events insert failed")?
        .unwrap_or(false);

        if did_insert {
            inserted += 1;
        }

        sqlx::query(
            r#"
            insert into infra.ingest_outbox (event_id)
            values ($1)
            on conflict (event_id) do nothing
            "#,
        )
        .bind(&ev.event_id)
        .execute(&mut *tx)
        .await
        .context("ingest_outbox insert failed")?;
    }

    sqlx::query(
        r#"
        update infra.cursors
        set last_processed_block = $2
        where id = $1 and last_processed_block < $2
        "#,
    )
    .bind(shard_id)
    .bind(to)
    .execute(&mut *tx)
    .await
    .context("cursor advance failed")?;

    tx.commit().await.context("commit append transaction")?;
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Ingest outbox (Publisher)
// ---------------------------------------------------------------------------

/// Select up to `limit` unpublished outbox rows, `event_id` ascending.
pub async fn outbox_select_unpublished(pool: &PgPool, limit: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select event_id
        from infra.ingest_outbox
        where published_at is null
        order by event_id asc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("outbox_select_unpublished failed")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count of still-unpublished outbox rows, refreshed once per publisher
/// iteration as a backlog gauge.
pub async fn outbox_count_unpublished(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from infra.ingest_outbox where published_at is null",
    )
    .fetch_one(pool)
    .await
    .context("outbox_count_unpublished failed")?;
    Ok(n)
}

/// Stamp `published_at` for one outbox row, unconditionally on the caller's
/// side (success or failure of the publish attempt) per the publisher's
/// documented contract. Idempotent: a row already stamped is left untouched.
pub async fn outbox_mark_published(pool: &PgPool, event_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        update infra.ingest_outbox
        set published_at = now()
        where event_id = $1 and published_at is null
        "#,
    )
    .bind(event_id)
    .execute(pool)
    .await
    .context("outbox_mark_published failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatcher (inbox)
// ---------------------------------------------------------------------------

/// One event as handed to a dispatcher's batch handler.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub event_id: String,
    pub block_number: i64,
    pub partition_key: String,
    pub address: String,
    pub topic0: Option<String>,
    pub payload: Value,
}

/// The dispatcher's selection query: published events matching
/// `partition_selector` (a prefix; empty matches all) that this
/// `handler_kind` has not already seen, ordered by `block_number`.
pub async fn select_eligible_events(
    pool: &PgPool,
    handler_kind: &str,
    partition_selector: &str,
    limit: i64,
) -> Result<Vec<ClaimedEvent>> {
    let rows = sqlx::query(
        r#"
        select e.event_id, e.block_number, e.partition_key, e.address, e.topic0, e.payload
        from infra.ingest_events e
        join infra.ingest_outbox o on o.event_id = e.event_id
        where o.published_at is not null
          and e.partition_key like ($2 || '%')
          and not exists (
              select 1 from infra.inbox_entries i
              where i.event_id = e.event_id and i.handler_kind = $1
          )
        order by e.block_number asc
        limit $3
        "#,
    )
    .bind(handler_kind)
    .bind(partition_selector)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("select_eligible_events failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(ClaimedEvent {
                event_id: row.try_get("event_id")?,
                block_number: row.try_get("block_number")?,
                partition_key: row.try_get("partition_key")?,
                address: row.try_get("address")?,
                topic0: row.try_get("topic0")?,
                payload: row.try_get("payload")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .context("select_eligible_events row decode failed")
}

/// Claim a batch: bulk-insert PENDING inbox rows, conflict-ignored, returning
/// only the event_ids this call actually inserted. An empty result means
/// another worker already claimed the whole batch.
pub async fn inbox_claim_batch(
    tx: &mut Transaction<'_, Postgres>,
    handler_kind: &str,
    candidates: &[ClaimedEvent],
) -> Result<Vec<String>> {
    let mut claimed = Vec::with_capacity(candidates.len());
    for ev in candidates {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into infra.inbox_entries
                (event_id, handler_kind, status, attempts, block_number, partition_key)
            values ($1, $2, 'PENDING', 0, $3, $4)
            on conflict (event_id, handler_kind) do nothing
            returning event_id
            "#,
        )
        .bind(&ev.event_id)
        .bind(handler_kind)
        .bind(ev.block_number)
        .bind(&ev.partition_key)
        .fetch_optional(&mut **tx)
        .await
        .context("inbox_claim_batch insert failed")?;

        if let Some((event_id,)) = row {
            claimed.push(event_id);
        }
    }
    Ok(claimed)
}

/// Settle a claimed batch as ACK: the handler committed successfully.
pub async fn inbox_settle_ack(
    tx: &mut Transaction<'_, Postgres>,
    handler_kind: &str,
    event_ids: &[String],
) -> Result<()> {
    sqlx::query(
        r#"
        update infra.inbox_entries
        set status = 'ACK', attempts = attempts + 1, last_attempt_at = now(), last_error = null
        where handler_kind = $1 and event_id = any($2)
        "#,
    )
    .bind(handler_kind)
    .bind(event_ids)
    .execute(&mut **tx)
    .await
    .context("inbox_settle_ack failed")?;
    Ok(())
}

/// Settle a claimed batch as FAIL (retriable) or DLQ (terminal), depending on
/// whether the post-increment attempt count reaches `max_attempts`.
pub async fn inbox_settle_fail(
    tx: &mut Transaction<'_, Postgres>,
    handler_kind: &str,
    event_ids: &[String],
    error: &str,
    max_attempts: i32,
) -> Result<()> {
    let truncated: String = error.chars().take(500).collect();
    sqlx::query(
        r#"
        update infra.inbox_entries
        set attempts = attempts + 1,
            last_attempt_at = now(),
            last_error = $3,
            status = case when attempts + 1 >= $4 then 'DLQ' else 'FAIL' end
        where handler_kind = $1 and event_id = any($2)
        "#,
    )
    .bind(handler_kind)
    .bind(event_ids)
    .bind(&truncated)
    .bind(max_attempts)
    .execute(&mut **tx)
    .await
    .context("inbox_settle_fail failed")?;
    Ok(())
}

/// Replay tool: for every published IngestEvent in `[from, to]`, insert a
/// PENDING inbox row for `handler_kind` if absent, or reset it to PENDING
/// (clearing `last_error`) if present. Returns `(inserted, reset)`.
pub async fn inbox_reset_range(
    pool: &PgPool,
    handler_kind: &str,
    from: i64,
    to: i64,
) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await.context("begin replay transaction")?;

    let candidates: Vec<(String, i64, String)> = sqlx::query_as(
        r#"
        select e.event_id, e.block_number, e.partition_key
        from infra.ingest_events e
        join infra.ingest_outbox o on o.event_id = e.event_id
        where o.published_at is not null
          and e.block_number between $1 and $2
        order by e.block_number asc
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *tx)
    .await
    .context("inbox_reset_range candidate select failed")?;

    let mut inserted = 0u64;
    let mut reset = 0u64;

    for (event_id, block_number, partition_key) in candidates {
        let (was_insert,): (bool,) = sqlx::query_as(
            r#"
            insert into infra.inbox_entries
                (event_id, handler_kind, status, attempts, block_number, partition_key, last_error)
            values ($1, $2, 'PENDING', 0, $3, $4, null)
            on conflict (event_id, handler_kind) do update
                set status = 'PENDING', last_error = null
            returning (xmax = 0) as was_insert
            "#,
        )
        .bind(&event_id)
        .bind(handler_kind)
        .bind(block_number)
        .bind(&partition_key)
        .fetch_one(&mut *tx)
        .await
        .context("inbox_reset_range upsert failed")?;

        if was_insert {
            inserted += 1;
        } else {
            reset += 1;
        }
    }

    tx.commit().await.context("commit replay transaction")?;
    Ok((inserted, reset))
}

/// DLQ/FAIL reset tool: reset every FAIL (and, if `include_dlq`, DLQ) row for
/// `handler_kind` back to PENDING. Returns the number of rows reset.
pub async fn inbox_reset_failed(
    pool: &PgPool,
    handler_kind: &str,
    include_dlq: bool,
) -> Result<u64> {
    let statuses: &[&str] = if include_dlq {
        &["FAIL", "DLQ"]
    } else {
        &["FAIL"]
    };

    let result = sqlx::query(
        r#"
        update infra.inbox_entries
        set status = 'PENDING', last_error = null
        where handler_kind = $1
          and status = any($2::text[]::infra.inbox_status[])
        "#,
    )
    .bind(handler_kind)
    .bind(statuses)
    .execute(pool)
    .await
    .context("inbox_reset_failed failed")?;

    Ok(result.rows_affected())
}

/// Per-status inbox counts for `handler_kind`, used by the status dump.
pub async fn inbox_status_counts(pool: &PgPool, handler_kind: &str) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        select status::text, count(*)::bigint
        from infra.inbox_entries
        where handler_kind = $1
        group by status
        order by status
        "#,
    )
    .bind(handler_kind)
    .fetch_all(pool)
    .await
    .context("inbox_status_counts failed")?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Domain outbox (Executor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DomainOutboxRow {
    pub command_key: String,
    pub kind: String,
    pub payload: Value,
}

/// Enqueue a domain command. Called by handlers inside the dispatch
/// transaction, using the same connection the handler was given.
pub async fn domain_outbox_enqueue(
    tx: &mut Transaction<'_, Postgres>,
    command_key: &str,
    kind: &str,
    payload: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into domain.domain_outbox (command_key, kind, payload)
        values ($1, $2, $3)
        on conflict (command_key) do nothing
        "#,
    )
    .bind(command_key)
    .bind(kind)
    .bind(payload)
    .execute(&mut **tx)
    .await
    .context("domain_outbox_enqueue failed")?;
    Ok(())
}

/// Select the first `limit` unpublished domain commands, `command_key` ascending.
pub async fn domain_outbox_select_pending(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<DomainOutboxRow>> {
    let rows = sqlx::query(
        r#"
        select command_key, kind, payload
        from domain.domain_outbox
        where published_at is null
        order by command_key asc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("domain_outbox_select_pending failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(DomainOutboxRow {
                command_key: row.try_get("command_key")?,
                kind: row.try_get("kind")?,
                payload: row.try_get("payload")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .context("domain_outbox_select_pending row decode failed")
}

/// Guarded idempotent submission record (I5/Q5): a no-op if another executor
/// already finished this command_key. Returns `true` if this call won the race.
pub async fn domain_outbox_mark_published(
    pool: &PgPool,
    command_key: &str,
    tx_hash: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        update domain.domain_outbox
        set published_at = now(), tx_hash = $2
        where command_key = $1 and published_at is null
        "#,
    )
    .bind(command_key)
    .bind(tx_hash)
    .execute(pool)
    .await
    .context("domain_outbox_mark_published failed")?;

    Ok(result.rows_affected() == 1)
}

/// Count of still-unpublished domain commands, refreshed once per executor
/// iteration as the `domain_outbox_unpublished` gauge.
pub async fn domain_outbox_count_pending(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from domain.domain_outbox where published_at is null")
            .fetch_one(pool)
            .await
            .context("domain_outbox_count_pending failed")?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Status dump
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub cursors: Vec<(String, i64)>,
    pub pending_ingest_outbox: i64,
    pub pending_domain_outbox: i64,
}

/// Everything the CLI's `status` command prints except the live chain head
/// (which comes from the RPC adapter, not the database).
pub async fn status_snapshot(pool: &PgPool) -> Result<StatusSnapshot> {
    let cursors: Vec<(String, i64)> =
        sqlx::query_as("select id, last_processed_block from infra.cursors order by id")
            .fetch_all(pool)
            .await
            .context("status_snapshot cursors failed")?;

    let (pending_ingest_outbox,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from infra.ingest_outbox where published_at is null",
    )
    .fetch_one(pool)
    .await
    .context("status_snapshot ingest outbox failed")?;

    let pending_domain_outbox = domain_outbox_count_pending(pool).await?;

    Ok(StatusSnapshot {
        cursors,
        pending_ingest_outbox,
        pending_domain_outbox,
    })
}

/// Timestamp helper used by tests that need to compare against `now()`.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
