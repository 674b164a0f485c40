use thiserror::Error;

/// Error taxonomy raised by [`crate::client`] calls. Every variant is
/// retriable at the caller's poll loop — the adapter itself never retries.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("circuit open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("rpc call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}
