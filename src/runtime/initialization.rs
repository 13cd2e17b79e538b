//! # Initialization
//!
//! Controller initialization logic including rustls setup, OpenTelemetry,
//! tracing, metrics, server startup, Kubernetes client setup and assembly of
//! the reload pipeline.

use crate::config::{ControllerConfig, ServerConfig};
use crate::controller::index::ResourceIndex;
use crate::controller::notifier::sinks::{LogSink, WebhookSink};
use crate::controller::notifier::{NotificationSink, Notifier};
use crate::controller::reloader::Reloader;
use crate::controller::server::{start_server, ServerState};
use crate::controller::trigger::{Dispatcher, KubeWorkloadApi, RolloutTrigger};
use crate::observability;
use anyhow::{anyhow, Context, Result};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Entry point of the reload pipeline
    pub reloader: Arc<Reloader>,
    /// Rollout worker pool, joined on shutdown
    pub dispatcher: Dispatcher,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// OpenTelemetry tracer provider (if initialized)
    pub otel_tracer_provider: Option<observability::otel::TracerProviderHandle>,
    pub controller_config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("controller_config", &self.controller_config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - OpenTelemetry initialization
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Index, notifier, rollout workers and reloader setup
pub async fn initialize() -> Result<InitializationResult> {
    // Configure rustls crypto provider FIRST, before any other operations
    // Required for rustls 0.23+ when no default provider is set via features
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_existing| anyhow!("Failed to install rustls crypto provider"))?;

    let controller_config = ControllerConfig::from_env();
    let server_config = ServerConfig::from_env();

    // When Datadog is configured, datadog-opentelemetry sets up its own tracing layer
    let otel_tracer_provider =
        observability::otel::init_otel().context("Failed to initialize OpenTelemetry")?;
    init_tracing(&controller_config, otel_tracer_provider.is_some());

    info!("Starting Config Reloader");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    // Initialize metrics
    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());

    // Start HTTP server for metrics and probes
    // Liveness passes as soon as it binds, readiness waits for the initial listings
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let defaults = controller_config
        .policy_defaults()
        .context("Invalid controller configuration")?;
    info!(
        annotation_domain = controller_config.annotation_domain.as_str(),
        auto_reload_all = defaults.auto_reload_all,
        strategy = defaults.strategy.as_str(),
        "Reload policy defaults loaded"
    );
    let keys = defaults.keys.clone();
    let index = Arc::new(ResourceIndex::new(defaults));

    let notifier = Notifier::new(
        controller_config.audit_log_capacity,
        notification_sinks(&controller_config)?,
        controller_config.notification_timeout(),
    );

    let api = Arc::new(KubeWorkloadApi::new(
        client.clone(),
        controller_config.field_manager.as_str(),
    ));
    let trigger = Arc::new(RolloutTrigger::new(
        api,
        keys,
        controller_config.rollout_settings(),
    ));
    let (queue, dispatcher) = Dispatcher::start(
        controller_config.rollout_queue_capacity,
        controller_config.max_concurrent_rollouts,
        trigger,
        notifier.clone(),
    );
    let reloader = Arc::new(Reloader::new(index, queue, notifier));

    info!(
        workers = controller_config.max_concurrent_rollouts,
        queue_capacity = controller_config.rollout_queue_capacity,
        "Controller initialized, starting watch loop..."
    );

    Ok(InitializationResult {
        client,
        reloader,
        dispatcher,
        server_state,
        otel_tracer_provider,
        controller_config,
    })
}

fn init_tracing(config: &ControllerConfig, otel_active: bool) {
    let default_directive = format!("config_reloader={}", config.log_level.to_lowercase());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directive))
        .unwrap_or_else(|_| "config_reloader=info".into());

    let result = if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        if otel_active {
            // datadog-opentelemetry may already have installed a subscriber
            warn!("Tracing subscriber init returned error (may already be initialized by Datadog): {}", e);
        } else {
            warn!("Tracing subscriber already initialized: {}", e);
        }
    }
}

fn notification_sinks(config: &ControllerConfig) -> Result<Vec<Arc<dyn NotificationSink>>> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = config.webhook_url.as_deref() {
        let webhook = WebhookSink::new(url, config.notification_timeout())
            .context("Failed to build webhook notification sink")?;
        info!("Webhook notifications enabled");
        sinks.push(Arc::new(webhook));
    }
    Ok(sinks)
}

/// Wait for the HTTP server to bind its port
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = server_config.startup_timeout();
    let poll_interval = server_config.poll_interval();
    let start_time = std::time::Instant::now();

    loop {
        // Check if server task crashed
        if server_handle.is_finished() {
            return Err(anyhow!("HTTP server failed to start"));
        }

        if server_state.is_listening.load(Ordering::Relaxed) {
            info!("HTTP server is listening and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow!(
                "HTTP server failed to start within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}
