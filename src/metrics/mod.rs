//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation and chain fetches
//! - Submission outcomes and confirmation latency
//! - Chain endpoint health

use crate::chain::BlockTag;
use crate::error::SubmitResult;
use crate::tx::FailureKind;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "niuniu_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "niuniu_nonces_allocated_total",
        "Total nonces handed out",
        &["chain_id"]
    ).unwrap();

    pub static ref NONCE_FETCHES: CounterVec = register_counter_vec!(
        "niuniu_nonce_fetches_total",
        "Base nonce reads issued to the chain",
        &["chain_id", "tag"]
    ).unwrap();

    pub static ref NONCE_RESETS: CounterVec = register_counter_vec!(
        "niuniu_nonce_resets_total",
        "Hard resets of the nonce allocator",
        &["chain_id"]
    ).unwrap();

    pub static ref PENDING_NONCES: GaugeVec = register_gauge_vec!(
        "niuniu_pending_nonces",
        "Nonces allocated but not yet confirmed or failed",
        &["chain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "niuniu_transactions_submitted_total",
        "Total transactions accepted by the chain",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "niuniu_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "niuniu_transactions_failed_total",
        "Total failed submissions by failure kind",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "niuniu_transaction_latency_seconds",
        "Time from submit to confirmation",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "niuniu_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "niuniu_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> SubmitResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::SubmitError::Config(format!("Metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::SubmitError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_nonce_allocated(chain_id: u64, pending: u64) {
    let label = chain_id.to_string();
    NONCES_ALLOCATED.with_label_values(&[&label]).inc();
    PENDING_NONCES.with_label_values(&[&label]).set(pending as f64);
}

pub fn record_pending_nonces(chain_id: u64, pending: u64) {
    PENDING_NONCES
        .with_label_values(&[&chain_id.to_string()])
        .set(pending as f64);
}

pub fn record_nonce_fetch(chain_id: u64, tag: BlockTag) {
    NONCE_FETCHES
        .with_label_values(&[&chain_id.to_string(), tag.as_str()])
        .inc();
}

pub fn record_nonce_reset(chain_id: u64) {
    let label = chain_id.to_string();
    NONCE_RESETS.with_label_values(&[&label]).inc();
    PENDING_NONCES.with_label_values(&[&label]).set(0.0);
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64, latency_secs: f64) {
    let label = chain_id.to_string();
    TX_CONFIRMED.with_label_values(&[&label]).inc();
    TX_LATENCY.with_label_values(&[&label]).observe(latency_secs);
}

pub fn record_tx_failed(chain_id: u64, kind: FailureKind) {
    let kind = match kind {
        FailureKind::NonceConflict => "nonce_conflict",
        FailureKind::UserRejected => "user_rejected",
        FailureKind::Other => "other",
    };
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
