//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Scheduler Metrics
    pub static ref SCHEDULER_PASSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_scheduler_passes_total", "Total number of scheduler scan passes"),
        &["status"]
    ).expect("metric can be created");
    pub static ref SUBSCRIPTIONS_DUE: IntGauge = IntGauge::new(
        "fedinbox_subscriptions_due",
        "Subscriptions found due in the most recent scan"
    ).expect("metric can be created");

    // Subscription Metrics
    pub static ref SUBSCRIPTION_POLLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_subscription_polls_total", "Total number of subscription connects"),
        &["method", "status"]
    ).expect("metric can be created");
    pub static ref CONNECT_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedinbox_connect_duration_seconds",
            "Duration of one subscription connect in seconds"
        ).buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["method"]
    ).expect("metric can be created");

    // Ingestion Metrics
    pub static ref DOCUMENTS_INGESTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_documents_ingested_total", "Inbound documents by ingestion outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref FILTER_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_filter_decisions_total", "Moderation filter results"),
        &["action"]
    ).expect("metric can be created");
    pub static ref MESSAGES_PURGED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_messages_purged_total", "Messages removed by retention"),
        &["status"]
    ).expect("metric can be created");

    // Task Metrics
    pub static ref BACKGROUND_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_background_tasks_total", "Fire-and-forget tasks by kind and status"),
        &["task", "status"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedinbox_errors_total", "Total number of errors surfaced over HTTP"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(SCHEDULER_PASSES_TOTAL.clone()))
        .expect("SCHEDULER_PASSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SUBSCRIPTIONS_DUE.clone()))
        .expect("SUBSCRIPTIONS_DUE can be registered");
    REGISTRY
        .register(Box::new(SUBSCRIPTION_POLLS_TOTAL.clone()))
        .expect("SUBSCRIPTION_POLLS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CONNECT_DURATION_SECONDS.clone()))
        .expect("CONNECT_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DOCUMENTS_INGESTED_TOTAL.clone()))
        .expect("DOCUMENTS_INGESTED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FILTER_DECISIONS_TOTAL.clone()))
        .expect("FILTER_DECISIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(MESSAGES_PURGED_TOTAL.clone()))
        .expect("MESSAGES_PURGED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(BACKGROUND_TASKS_TOTAL.clone()))
        .expect("BACKGROUND_TASKS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record the outcome and duration of one subscription connect.
pub fn observe_connect(method: &str, status: &str, elapsed: Duration) {
    SUBSCRIPTION_POLLS_TOTAL
        .with_label_values(&[method, status])
        .inc();
    CONNECT_DURATION_SECONDS
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

/// Render the registry in the Prometheus text format.
pub fn render() -> Result<String, crate::error::AppError> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| crate::error::AppError::Internal(e.into()))?;
    String::from_utf8(buffer).map_err(|e| crate::error::AppError::Internal(e.into()))
}
