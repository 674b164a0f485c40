//! Q1 (idempotent ingest) + Q3 (paired outbox) + I3 (atomic append).
//!
//! Requires `INDEXER_DATABASE_URL`; skipped otherwise.

use idx_db::NewIngestEvent;
use serde_json::json;

async fn pool() -> Option<sqlx::PgPool> {
    let url = std::env::var(idx_db::ENV_DB_URL).ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect");
    idx_db::migrate(&pool).await.expect("migrate");
    Some(pool)
}

fn event(n: i64) -> NewIngestEvent {
    NewIngestEvent {
        event_id: format!("0xdead:{n}:1:2"),
        block_number: n,
        block_hash: "0xdead".to_string(),
        tx_index: 1,
        log_index: 2,
        address: "0xabc".to_string(),
        topic0: Some("0xtopic".to_string()),
        partition_key: "abc".to_string(),
        payload: json!({"n": n}),
    }
}

#[tokio::test]
async fn duplicate_log_across_overlapping_scans_yields_one_row() {
    let Some(pool) = pool().await else { return };
    let shard = "test:idempotent-ingest";

    let first = idx_db::cursor_advance_with_events(&pool, shard, &[event(16)], 16)
        .await
        .unwrap();
    assert_eq!(first, 1);

    // Overlapping rescan of the same range: same event, same event_id.
    let second = idx_db::cursor_advance_with_events(&pool, shard, &[event(16)], 16)
        .await
        .unwrap();
    assert_eq!(second, 0, "duplicate insert must be silently ignored");

    let (count,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from infra.ingest_events where event_id = '0xdead:16:1:2'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    let hwm = idx_db::cursor_get(&pool, shard).await.unwrap();
    assert_eq!(hwm, 16);
}

#[tokio::test]
async fn every_ingest_event_gets_exactly_one_outbox_row() {
    let Some(pool) = pool().await else { return };
    let shard = "test:paired-outbox";

    idx_db::cursor_advance_with_events(&pool, shard, &[event(20), event(21)], 21)
        .await
        .unwrap();

    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from infra.ingest_events e
        join infra.ingest_outbox o on o.event_id = e.event_id
        where e.event_id in ('0xdead:20:1:2', '0xdead:21:1:2')
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(n, 2);
}

#[tokio::test]
async fn empty_log_set_still_advances_cursor() {
    let Some(pool) = pool().await else { return };
    let shard = "test:empty-range-advance";

    let inserted = idx_db::cursor_advance_with_events(&pool, shard, &[], 42)
        .await
        .unwrap();
    assert_eq!(inserted, 0);
    assert_eq!(idx_db::cursor_get(&pool, shard).await.unwrap(), 42);
}

#[tokio::test]
async fn cursor_is_monotone_non_decreasing() {
    let Some(pool) = pool().await else { return };
    let shard = "test:monotone-cursor";

    idx_db::cursor_advance_with_events(&pool, shard, &[], 100)
        .await
        .unwrap();
    // A stale/late caller attempting to move the cursor backwards is a no-op.
    idx_db::cursor_advance_with_events(&pool, shard, &[], 50)
        .await
        .unwrap();
    assert_eq!(idx_db::cursor_get(&pool, shard).await.unwrap(), 100);
}
