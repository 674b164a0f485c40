//! RPC adapter: rate-limited, circuit-broken JSON-RPC read/write pools.
//!
//! Every call passes through three layers in order: token-bucket rate
//! limit, circuit breaker, per-call deadline. Retries are left to callers —
//! the Scanner narrows its step on failure instead of retrying in place.

mod circuit_breaker;
mod client;
mod error;
mod rate_limit;
mod transport;

pub use circuit_breaker::{Admit, CircuitBreaker};
pub use client::{JsonRpcClient, PoolConfig, ReadClient, WriteClient};
pub use error::RpcError;
pub use rate_limit::TokenBucket;
pub use transport::{Log, LogFilter};
