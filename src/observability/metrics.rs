//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `reloader_resource_events_total` - Watch events observed, by kind and event type
//! - `reloader_content_changes_total` - Fingerprint changes detected, by kind
//! - `reloader_reloads_total` - Reload outcomes, by outcome and strategy
//! - `reloader_rollout_attempt_duration_seconds` - Duration of single rollout attempts
//! - `reloader_rollout_retries_total` - Rollout attempts retried after a retryable error
//! - `reloader_policy_misconfigurations_total` - Workloads reported as misconfigured
//! - `reloader_notification_failures_total` - Failed sink deliveries, by sink
//! - `reloader_watch_errors_total` - Watch stream errors, by kind and reason
//! - `reloader_pending_paused_reloads` - Reloads waiting for a pause window to elapse
//! - `reloader_indexed_resources` / `reloader_indexed_workloads` - Index sizes

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RESOURCE_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reloader_resource_events_total",
            "Total number of ConfigMap/Secret watch events observed",
        ),
        &["kind", "event"],
    )
    .expect("Failed to create RESOURCE_EVENTS_TOTAL metric - this should never happen")
});

static CONTENT_CHANGES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reloader_content_changes_total",
            "Total number of content fingerprint changes detected",
        ),
        &["kind"],
    )
    .expect("Failed to create CONTENT_CHANGES_TOTAL metric - this should never happen")
});

static RELOADS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("reloader_reloads_total", "Total number of reload outcomes"),
        &["outcome", "strategy"],
    )
    .expect("Failed to create RELOADS_TOTAL metric - this should never happen")
});

static ROLLOUT_ATTEMPT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "reloader_rollout_attempt_duration_seconds",
            "Duration of single rollout attempts in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .expect("Failed to create ROLLOUT_ATTEMPT_DURATION metric - this should never happen")
});

static ROLLOUT_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reloader_rollout_retries_total",
        "Total number of rollout attempts retried after a retryable error",
    )
    .expect("Failed to create ROLLOUT_RETRIES_TOTAL metric - this should never happen")
});

static POLICY_MISCONFIGURATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reloader_policy_misconfigurations_total",
        "Total number of workloads reported with invalid reload annotations",
    )
    .expect("Failed to create POLICY_MISCONFIGURATIONS_TOTAL metric - this should never happen")
});

static NOTIFICATION_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reloader_notification_failures_total",
            "Total number of failed notification deliveries",
        ),
        &["sink"],
    )
    .expect("Failed to create NOTIFICATION_FAILURES_TOTAL metric - this should never happen")
});

static WATCH_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reloader_watch_errors_total",
            "Total number of watch stream errors",
        ),
        &["kind", "reason"],
    )
    .expect("Failed to create WATCH_ERRORS_TOTAL metric - this should never happen")
});

static PENDING_PAUSED_RELOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "reloader_pending_paused_reloads",
        "Current number of reloads waiting for a pause window to elapse",
    )
    .expect("Failed to create PENDING_PAUSED_RELOADS metric - this should never happen")
});

static INDEXED_RESOURCES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "reloader_indexed_resources",
        "Current number of ConfigMaps/Secrets tracked",
    )
    .expect("Failed to create INDEXED_RESOURCES metric - this should never happen")
});

static INDEXED_WORKLOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "reloader_indexed_workloads",
        "Current number of workloads tracked",
    )
    .expect("Failed to create INDEXED_WORKLOADS metric - this should never happen")
});

/// Register all metrics with the registry
///
/// # Errors
///
/// Returns an error if a metric is registered twice.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RESOURCE_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONTENT_CHANGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RELOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROLLOUT_ATTEMPT_DURATION.clone()))?;
    REGISTRY.register(Box::new(ROLLOUT_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLICY_MISCONFIGURATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(NOTIFICATION_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PENDING_PAUSED_RELOADS.clone()))?;
    REGISTRY.register(Box::new(INDEXED_RESOURCES.clone()))?;
    REGISTRY.register(Box::new(INDEXED_WORKLOADS.clone()))?;
    Ok(())
}

pub fn increment_resource_events(kind: &str, event: &str) {
    RESOURCE_EVENTS_TOTAL.with_label_values(&[kind, event]).inc();
}

pub fn increment_content_changes(kind: &str) {
    CONTENT_CHANGES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reloads(outcome: &str, strategy: &str) {
    RELOADS_TOTAL.with_label_values(&[outcome, strategy]).inc();
}

pub fn observe_rollout_attempt_duration(duration: f64) {
    ROLLOUT_ATTEMPT_DURATION.observe(duration);
}

pub fn increment_rollout_retries() {
    ROLLOUT_RETRIES_TOTAL.inc();
}

pub fn increment_policy_misconfigurations() {
    POLICY_MISCONFIGURATIONS_TOTAL.inc();
}

pub fn increment_notification_failures(sink: &str) {
    NOTIFICATION_FAILURES_TOTAL.with_label_values(&[sink]).inc();
}

pub fn increment_watch_errors(kind: &str, reason: &str) {
    WATCH_ERRORS_TOTAL.with_label_values(&[kind, reason]).inc();
}

pub fn set_pending_paused_reloads(count: i64) {
    PENDING_PAUSED_RELOADS.set(count);
}

pub fn set_indexed_resources(count: i64) {
    INDEXED_RESOURCES.set(count);
}

pub fn set_indexed_workloads(count: i64) {
    INDEXED_WORKLOADS.set(count);
}
