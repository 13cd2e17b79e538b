//! # OpenTelemetry Support
//!
//! Optional Datadog trace export via `datadog-opentelemetry`.
//!
//! Export is enabled only when `DD_API_KEY` is present in the environment.
//! `DD_SERVICE`, `DD_VERSION`, `DD_ENV`, `DD_SITE` and `DD_TRACE_AGENT_URL`
//! are honoured when set and defaulted otherwise.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

/// Tracer provider handle for graceful shutdown
#[derive(Debug)]
pub struct TracerProviderHandle(opentelemetry_sdk::trace::SdkTracerProvider);

/// Initialize Datadog tracing if configured
///
/// Returns `Ok(None)` when `DD_API_KEY` is absent.
///
/// # Errors
///
/// Reserved for exporter initialization failures.
pub fn init_otel() -> Result<Option<TracerProviderHandle>> {
    if std::env::var("DD_API_KEY").is_err() {
        info!("No Datadog configuration provided, skipping Otel initialization");
        return Ok(None);
    }

    if std::env::var("DD_SERVICE").is_err() {
        std::env::set_var("DD_SERVICE", "config-reloader");
    }
    if std::env::var("DD_VERSION").is_err() {
        let build_version = format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("BUILD_GIT_HASH"));
        std::env::set_var("DD_VERSION", build_version);
    }
    if std::env::var("DD_SITE").is_err() {
        std::env::set_var("DD_SITE", "datadoghq.com");
    }
    if std::env::var("DD_TRACE_AGENT_URL").is_err() {
        std::env::set_var("DD_TRACE_AGENT_URL", "http://localhost:8126");
    }

    info!(
        service = %std::env::var("DD_SERVICE").unwrap_or_default(),
        version = %std::env::var("DD_VERSION").unwrap_or_default(),
        env = ?std::env::var("DD_ENV").ok(),
        agent = %std::env::var("DD_TRACE_AGENT_URL").unwrap_or_default(),
        "Initializing Datadog OpenTelemetry tracing"
    );

    let tracer_provider = datadog_opentelemetry::tracing().init();
    info!("Datadog OpenTelemetry tracing initialized");

    Ok(Some(TracerProviderHandle(tracer_provider)))
}

/// Flush pending spans and shut the tracer provider down
pub fn shutdown_otel(tracer_provider: Option<TracerProviderHandle>) {
    let Some(TracerProviderHandle(provider)) = tracer_provider else {
        return;
    };
    info!("Shutting down Datadog tracer provider...");
    if let Err(e) = provider.shutdown_with_timeout(Duration::from_secs(5)) {
        warn!("Error shutting down Datadog tracer provider: {}", e);
    } else {
        info!("Datadog tracer provider shut down");
    }
}
