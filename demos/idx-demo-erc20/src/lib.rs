//! Example projector showing how an out-of-tree consumer implements
//! [`idx_dispatcher::BatchHandler`]: projects ERC-20 `Transfer` logs into a
//! toy `token_balances` table and enqueues one acknowledgement command per
//! transfer through the domain outbox.
//!
//! Not part of the core pipeline. Exists to exercise the dispatcher/executor
//! contract end-to-end in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use idx_db::ClaimedEvent;
use sqlx::{Postgres, Transaction};

pub const HANDLER_KIND: &str = "demo.erc20_transfers";

/// `keccak256("Transfer(address,address,uint256)")`, lowercase hex.
pub const TRANSFER_TOPIC0: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Transfer {
    from: String,
    to: String,
    amount: i64,
}

/// Decode a 32-byte topic into a lowercase `0x`-prefixed 20-byte address by
/// taking its last 20 bytes, the same left-padding ERC-20 indexed address
/// topics always use.
fn topic_to_address(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() < 40 {
        return None;
    }
    Some(format!("0x{}", &hex[hex.len() - 40..]))
}

fn parse_transfer(topics: &[String], data: &str) -> Option<Transfer> {
    if topics.first().map(String::as_str) != Some(TRANSFER_TOPIC0) {
        return None;
    }
    let from = topic_to_address(topics.get(1)?)?;
    let to = topic_to_address(topics.get(2)?)?;
    let hex = data.strip_prefix("0x").unwrap_or(data);
    let amount = i64::from_str_radix(hex.trim_start_matches('0'), 16).unwrap_or(0);
    Some(Transfer { from, to, amount })
}

async fn upsert_balance(
    tx: &mut Transaction<'_, Postgres>,
    address: &str,
    token: &str,
    delta: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into domain.token_balances (address, token, balance_micros)
        values ($1, $2, $3)
        on conflict (address, token) do update
            set balance_micros = domain.token_balances.balance_micros + excluded.balance_micros
        "#,
    )
    .bind(address)
    .bind(token)
    .bind(delta)
    .execute(&mut **tx)
    .await
    .context("token_balances upsert failed")?;
    Ok(())
}

/// Projects `Transfer` logs for one ERC-20 `token` address into
/// `domain.token_balances` and records a `demo.ack` domain command per
/// transfer so the executor's contract has something to submit.
pub struct Erc20TransferProjector {
    pub token: String,
}

#[async_trait]
impl idx_dispatcher::BatchHandler for Erc20TransferProjector {
    async fn handle(
        &self,
        events: &[ClaimedEvent],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<()> {
        for event in events {
            let topics: Vec<String> = event
                .payload
                .get("topics")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            let data = event
                .payload
                .get("data")
                .and_then(|v| v.as_str())
                .unwrap_or("0x");

            let Some(transfer) = parse_transfer(&topics, data) else {
                continue;
            };

            upsert_balance(tx, &transfer.from, &self.token, -transfer.amount).await?;
            upsert_balance(tx, &transfer.to, &self.token, transfer.amount).await?;

            let command_key = format!("demo.ack:{}", event.event_id);
            idx_db::domain_outbox_enqueue(
                tx,
                &command_key,
                "demo.ack",
                &serde_json::json!({
                    "event_id": event.event_id,
                    "from": transfer.from,
                    "to": transfer.to,
                    "amount": transfer.amount,
                }),
            )
            .await
            .context("demo ack enqueue failed")?;
        }
        Ok(())
    }
}

/// Apply this demo's own migrations (`domain.token_balances`). Call after
/// `idx_db::migrate` so the `domain` schema already exists.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("demo migrate failed")?;
    Ok(())
}
