// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the Converge control plane.
//!
//! All metrics use the namespace prefix `converge_` and are registered in a
//! global registry exposed via the `/metrics` endpoint.
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - Track attempts and their outcomes
//! - **Event Bus Metrics** - Track published and dropped events
//! - **Admission Metrics** - Track webhook denials and transport failures
//! - **Resource Lifecycle Metrics** - Track creates, updates, and deletes

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;

/// Namespace prefix for all Converge metrics
const METRICS_NAMESPACE: &str = "converge";

/// Global Prometheus metrics registry
///
/// All metrics are registered in this registry and exposed via `/metrics`.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliation attempts by resource type and outcome
///
/// Labels:
/// - `resource_type`: resource type name
/// - `status`: Outcome (`success`, `error`)
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of reconciliation attempts by resource type and outcome",
    );
    let counter = CounterVec::new(opts, &["resource_type", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliation attempts in seconds
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of reconciliation attempts in seconds by resource type",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["resource_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Number of reconciliation attempts currently in flight
pub static RECONCILIATIONS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        format!("{METRICS_NAMESPACE}_reconciliations_in_flight"),
        "Number of reconciliation attempts currently in flight",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Event Bus Metrics
// ============================================================================

/// Total events published to the bus
///
/// Labels:
/// - `event_type`: `CREATED`, `MODIFIED`, `DELETED`, `RECONCILED`
pub static EVENTS_PUBLISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_events_published_total"),
        "Total events published to the bus by event type",
    );
    let counter = CounterVec::new(opts, &["event_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total events dropped due to full subscriber queues
pub static EVENTS_DROPPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_events_dropped_total"),
        "Total events dropped due to full subscriber queues",
    );
    let counter = CounterVec::new(opts, &["event_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Admission Metrics
// ============================================================================

/// Total admission denials by webhook name
pub static ADMISSION_DENIALS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_admission_denials_total"),
        "Total admission denials by webhook name",
    );
    let counter = CounterVec::new(opts, &["webhook"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total webhook transport failures by webhook name and failure policy
pub static WEBHOOK_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_webhook_failures_total"),
        "Total webhook transport failures by webhook name and failure policy",
    );
    let counter = CounterVec::new(opts, &["webhook", "failure_policy"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Resource Lifecycle Metrics
// ============================================================================

/// Total number of resources created by type
pub static RESOURCES_CREATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_resources_created_total"),
        "Total number of resources created by type",
    );
    let counter = CounterVec::new(opts, &["resource_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total number of resources hard-deleted by type
pub static RESOURCES_DELETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_resources_deleted_total"),
        "Total number of resources hard-deleted by type",
    );
    let counter = CounterVec::new(opts, &["resource_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a successful reconciliation attempt.
pub fn record_reconciliation_success(resource_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "success"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[resource_type])
        .observe(duration.as_secs_f64());
}

/// Record a failed reconciliation attempt.
pub fn record_reconciliation_error(resource_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "error"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[resource_type])
        .observe(duration.as_secs_f64());
}

/// Record a published event.
pub fn record_event_published(event_type: &str) {
    EVENTS_PUBLISHED_TOTAL.with_label_values(&[event_type]).inc();
}

/// Record an event dropped on a full subscriber queue.
pub fn record_event_dropped(event_type: &str) {
    EVENTS_DROPPED_TOTAL.with_label_values(&[event_type]).inc();
}

/// Record an admission denial.
pub fn record_admission_denied(webhook: &str) {
    ADMISSION_DENIALS_TOTAL.with_label_values(&[webhook]).inc();
}

/// Record a webhook transport failure.
pub fn record_webhook_failure(webhook: &str, failure_policy: &str) {
    WEBHOOK_FAILURES_TOTAL
        .with_label_values(&[webhook, failure_policy])
        .inc();
}

/// Record a resource creation.
pub fn record_resource_created(resource_type: &str) {
    RESOURCES_CREATED_TOTAL
        .with_label_values(&[resource_type])
        .inc();
}

/// Record a resource hard deletion.
pub fn record_resource_deleted(resource_type: &str) {
    RESOURCES_DELETED_TOTAL
        .with_label_values(&[resource_type])
        .inc();
}

/// Gather all registered metrics in Prometheus text exposition format.
///
/// # Errors
///
/// Returns an error if metric encoding fails.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
