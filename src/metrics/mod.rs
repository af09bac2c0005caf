//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain heights
//! - Atomic transactions and their sub-transactions
//! - Cross-chain calls and remote waits
//! - Executor commits and discards
//! - Live coordination contexts

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::ChainId;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEIGHT: GaugeVec = register_gauge_vec!(
        "multichain_chain_height",
        "Latest committed height per chain",
        &["chain_id"]
    ).unwrap();

    // Execution metrics
    pub static ref EXECUTIONS: CounterVec = register_counter_vec!(
        "multichain_executions_total",
        "Executor runs by outcome (commit, discard, query)",
        &["chain_id", "outcome"]
    ).unwrap();

    // Atomic transaction metrics
    pub static ref ATOMIC_TXS: CounterVec = register_counter_vec!(
        "multichain_atomic_transactions_total",
        "Atomic transactions by participant chain and outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    pub static ref SUB_TXS: CounterVec = register_counter_vec!(
        "multichain_sub_transactions_total",
        "Locally executed sub-transactions by status",
        &["chain_id", "status"]
    ).unwrap();

    pub static ref REMOTE_WAIT_LATENCY: HistogramVec = register_histogram_vec!(
        "multichain_remote_wait_seconds",
        "Time spent waiting on another chain's sub-transaction result",
        &["chain_id"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // Cross-chain call metrics
    pub static ref CROSS_CALLS: CounterVec = register_counter_vec!(
        "multichain_cross_chain_calls_total",
        "Cross-chain calls by caller, callee and kind",
        &["from_chain_id", "to_chain_id", "kind"]
    ).unwrap();

    pub static ref CROSS_CALL_LATENCY: HistogramVec = register_histogram_vec!(
        "multichain_cross_chain_call_seconds",
        "Cross-chain call round trip latency",
        &["from_chain_id", "to_chain_id"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Coordination metrics
    pub static ref LIVE_CONTEXTS: Gauge = register_gauge!(
        "multichain_coordination_contexts",
        "Coordination contexts currently open"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    gather_text().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Render every registered metric in the text exposition format
pub fn gather_text() -> CoordinatorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| CoordinatorError::Internal(format!("metrics encoding: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| CoordinatorError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_height(chain_id: &ChainId, height: u64) {
    CHAIN_HEIGHT
        .with_label_values(&[chain_id.as_str()])
        .set(height as f64);
}

pub fn record_execution(chain_id: &ChainId, outcome: &str) {
    EXECUTIONS
        .with_label_values(&[chain_id.as_str(), outcome])
        .inc();
}

pub fn record_atomic_tx(chain_id: &ChainId, outcome: &str) {
    ATOMIC_TXS
        .with_label_values(&[chain_id.as_str(), outcome])
        .inc();
}

pub fn record_sub_tx(chain_id: &ChainId, ok: bool) {
    SUB_TXS
        .with_label_values(&[chain_id.as_str(), if ok { "ok" } else { "failed" }])
        .inc();
}

pub fn record_remote_wait(chain_id: &ChainId, latency_secs: f64) {
    REMOTE_WAIT_LATENCY
        .with_label_values(&[chain_id.as_str()])
        .observe(latency_secs);
}

pub fn record_cross_call(from: &ChainId, to: &ChainId, kind: &str, latency_secs: f64) {
    CROSS_CALLS
        .with_label_values(&[from.as_str(), to.as_str(), kind])
        .inc();
    CROSS_CALL_LATENCY
        .with_label_values(&[from.as_str(), to.as_str()])
        .observe(latency_secs);
}

pub fn record_context_opened() {
    LIVE_CONTEXTS.inc();
}

pub fn record_context_closed() {
    LIVE_CONTEXTS.dec();
}
