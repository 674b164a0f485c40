//! Process-wide Prometheus registrations and the `/metrics` + `/healthz`
//! server shared by every indexer component.
//!
//! Each component increments the counters/histograms it owns directly;
//! this crate only owns registration and the HTTP exposition endpoint, the
//! same split the daemon uses for its own status surface.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, Histogram, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

/// RPC calls attempted, by method. Incremented once per call regardless of
/// outcome; `rpc_errors_total` tracks the failing subset.
pub static RPC_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_requests_total",
        "RPC calls attempted by method",
        &["method"]
    )
    .unwrap()
});

pub static RPC_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_errors_total",
        "RPC calls that did not return a result, by method",
        &["method"]
    )
    .unwrap()
});

pub static HEAD_FETCH_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "head_fetch_latency_seconds",
        "Latency of ReadClient::get_head_block calls"
    )
    .unwrap()
});

pub static LOG_FETCH_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "log_fetch_latency_seconds",
        "Latency of ReadClient::get_logs calls"
    )
    .unwrap()
});

/// Scanner lag: `head - last_processed_block` for each shard, refreshed
/// every scan iteration.
pub static INDEXER_BACKLOG: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "indexer_backlog",
        "Blocks behind head for a scanner shard",
        &["shard"]
    )
    .unwrap()
});

/// Configured open-window length for a circuit breaker pool. Both the read
/// and write pools publish this symmetrically so an operator can read
/// cooldown configuration straight off `/metrics` without a config dump.
pub static CB_OPEN_SECONDS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "cb_open_seconds",
        "Configured circuit breaker cooldown window, in seconds, per pool",
        &["pool"]
    )
    .unwrap()
});

pub static INBOX_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "inbox_attempts_total",
        "Inbox settle attempts by handler_kind and resulting status",
        &["handler_kind", "status"]
    )
    .unwrap()
});

pub static DLQ_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dlq_total",
        "Inbox entries moved to DLQ by handler_kind",
        &["handler_kind"]
    )
    .unwrap()
});

pub static DOMAIN_OUTBOX_UNPUBLISHED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "domain_outbox_unpublished",
        "Domain outbox rows awaiting submission at last executor poll"
    )
    .unwrap()
});

/// Force every `Lazy` metric to register eagerly. Call once at process
/// startup so `/metrics` is never empty on the first scrape.
pub fn init() {
    Lazy::force(&RPC_REQUESTS_TOTAL);
    Lazy::force(&RPC_ERRORS_TOTAL);
    Lazy::force(&HEAD_FETCH_LATENCY_SECONDS);
    Lazy::force(&LOG_FETCH_LATENCY_SECONDS);
    Lazy::force(&INDEXER_BACKLOG);
    Lazy::force(&CB_OPEN_SECONDS);
    Lazy::force(&INBOX_ATTEMPTS_TOTAL);
    Lazy::force(&DLQ_TOTAL);
    Lazy::force(&DOMAIN_OUTBOX_UNPUBLISHED);
}

async fn metrics_handler() -> impl IntoResponse {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        tracing::error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buf) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(error = %err, "metrics output was not valid utf-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn healthz_handler(State(service): State<&'static str>) -> impl IntoResponse {
    (StatusCode::OK, service)
}

fn build_router(service: &'static str) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(service)
}

/// Bind and serve the `/metrics` + `/healthz` HTTP surface. Runs until the
/// process is killed; callers `tokio::spawn` this alongside their main loop.
pub async fn serve(bind_addr: SocketAddr, service: &'static str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding metrics listener on {bind_addr}"))?;
    tracing::info!(%bind_addr, service, "metrics server listening");
    axum::serve(listener, build_router(service))
        .await
        .context("metrics server exited")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_exposes_registered_series() {
        init();
        RPC_REQUESTS_TOTAL.with_label_values(&["blockNumber"]).inc();

        let router = build_router("idx-test");
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("rpc_requests_total"));
        assert!(text.contains("domain_outbox_unpublished"));
    }

    #[tokio::test]
    async fn healthz_returns_ok_body() {
        let router = build_router("idx-test");
        let response = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
