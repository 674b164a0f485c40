use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use idx_metrics::{
    HEAD_FETCH_LATENCY_SECONDS, LOG_FETCH_LATENCY_SECONDS, RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL,
};

use crate::circuit_breaker::{Admit, CircuitBreaker};
use crate::error::RpcError;
use crate::rate_limit::TokenBucket;
use crate::transport::{
    from_hex, GetLogsParams, JsonRpcRequest, JsonRpcResponse, Log, LogFilter, WireLog,
};

/// Node-side method names, fixed by the wire contract: `blockNumber` returns
/// the hex-encoded chain height, `getLogs` takes a `{fromBlock, toBlock,
/// address?, topics?}` filter object. The write method name is not
/// standardized by the contract (the core treats it as opaque); this
/// follows the same bare-camelCase convention as the two read methods.
const METHOD_BLOCK_NUMBER: &str = "blockNumber";
const METHOD_GET_LOGS: &str = "getLogs";
const METHOD_SEND_RAW_TRANSACTION: &str = "sendRawTransaction";

#[async_trait]
pub trait ReadClient: Send + Sync {
    async fn get_head_block(&self) -> Result<u64, RpcError>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, RpcError>;
}

#[async_trait]
pub trait WriteClient: Send + Sync {
    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<String, RpcError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub rps_max: f64,
    pub burst: Option<f64>,
    pub failure_threshold: u32,
    pub open_seconds: u64,
    pub head_timeout: Duration,
    pub get_logs_timeout: Duration,
    pub send_tx_timeout: Duration,
}

/// A single named RPC pool: one rate limiter, one circuit breaker, one HTTP
/// endpoint. The Scanner uses a read pool, the Executor a write pool; they
/// never share a breaker, so a stuck write endpoint never blocks ingest.
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    pool_label: &'static str,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    cfg: PoolConfig,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, cfg: PoolConfig, pool_label: &'static str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            pool_label,
            bucket: TokenBucket::new(cfg.rps_max, cfg.burst),
            breaker: CircuitBreaker::new(cfg.failure_threshold, cfg.open_seconds, pool_label),
            cfg,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError> {
        self.bucket.take().await;

        RPC_REQUESTS_TOTAL.with_label_values(&[method]).inc();

        if let Admit::Rejected { retry_after_secs } = self.breaker.admit() {
            RPC_ERRORS_TOTAL.with_label_values(&[method]).inc();
            return Err(RpcError::CircuitOpen { retry_after_secs });
        }

        let start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.do_call(method, params)).await {
            Ok(inner) => inner,
            Err(_) => Err(RpcError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            }),
        };

        let elapsed = start.elapsed().as_secs_f64();
        match method {
            METHOD_BLOCK_NUMBER => HEAD_FETCH_LATENCY_SECONDS.observe(elapsed),
            METHOD_GET_LOGS => LOG_FETCH_LATENCY_SECONDS.observe(elapsed),
            _ => {}
        }

        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(err) => {
                self.breaker.record_failure();
                RPC_ERRORS_TOTAL.with_label_values(&[method]).inc();
                tracing::warn!(pool = self.pool_label, method, error = %err, "rpc call failed");
            }
        }
        outcome
    }

    async fn do_call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        body.result
            .ok_or_else(|| RpcError::Transport("rpc response had neither result nor error".into()))
    }
}

#[async_trait]
impl ReadClient for JsonRpcClient {
    async fn get_head_block(&self) -> Result<u64, RpcError> {
        let result = self
            .call(METHOD_BLOCK_NUMBER, json!([]), self.cfg.head_timeout)
            .await?;
        let hex = result
            .as_str()
            .ok_or_else(|| RpcError::Transport("head block was not a hex string".into()))?;
        from_hex(hex).map_err(RpcError::Transport)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, RpcError> {
        let params = serde_json::to_value(GetLogsParams::from(filter))
            .map_err(|e| RpcError::Transport(format!("encoding getLogs params: {e}")))?;
        let result = self
            .call(METHOD_GET_LOGS, params, self.cfg.get_logs_timeout)
            .await?;
        let wire_logs: Vec<WireLog> = serde_json::from_value(result)
            .map_err(|e| RpcError::Transport(format!("malformed logs payload: {e}")))?;
        wire_logs
            .into_iter()
            .map(|wire| Log::try_from(wire).map_err(RpcError::Transport))
            .collect()
    }
}

#[async_trait]
impl WriteClient for JsonRpcClient {
    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<String, RpcError> {
        let params = json!([raw_tx]);
        let result = self
            .call(METHOD_SEND_RAW_TRANSACTION, params, self.cfg.send_tx_timeout)
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Transport("tx hash was not a string".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn pool_config() -> PoolConfig {
        PoolConfig {
            rps_max: 1000.0,
            burst: Some(1000.0),
            failure_threshold: 5,
            open_seconds: 5,
            head_timeout: Duration::from_secs(1),
            get_logs_timeout: Duration::from_secs(1),
            send_tx_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn get_head_block_parses_hex_result() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/").json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "blockNumber",
                "params": []
            }));
            then.status(200)
                .json_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x3039"}));
        });

        let client = JsonRpcClient::new(server.base_url(), pool_config(), "read");
        let head = client.get_head_block().await.unwrap();
        assert_eq!(head, 12345);
        mock.assert();
    }

    #[tokio::test]
    async fn rpc_level_error_is_surfaced() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32000, "message": "boom"}
            }));
        });

        let client = JsonRpcClient::new(server.base_url(), pool_config(), "read");
        let err = client.get_head_block().await.unwrap_err();
        match err {
            RpcError::Rpc { code, message } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "boom");
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_failures_trip_the_circuit() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(500);
        });

        let mut cfg = pool_config();
        cfg.failure_threshold = 2;
        let client = JsonRpcClient::new(server.base_url(), cfg, "read");

        let _ = client.get_head_block().await;
        let _ = client.get_head_block().await;
        let err = client.get_head_block().await.unwrap_err();
        assert!(matches!(err, RpcError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn get_logs_sends_hex_range_and_parses_camel_case_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/").json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "getLogs",
                "params": {
                    "fromBlock": "0x1",
                    "toBlock": "0xa",
                    "address": "0xdead"
                }
            }));
            then.status(200).json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": [{
                    "address": "0xdead",
                    "blockHash": "0xabc",
                    "blockNumber": "0xa",
                    "data": "0x",
                    "logIndex": "0x0",
                    "topics": ["0xtopic"],
                    "transactionHash": "0xtx",
                    "transactionIndex": "0x0"
                }]
            }));
        });

        let client = JsonRpcClient::new(server.base_url(), pool_config(), "read");
        let filter = LogFilter {
            address: Some("0xdead".to_string()),
            topic0: None,
            from_block: 1,
            to_block: 10,
        };
        let logs = client.get_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 10);
        assert_eq!(logs[0].tx_hash, "0xtx");
        mock.assert();
    }
}
