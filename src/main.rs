//! # Config Reloader
//!
//! A Kubernetes controller that rolls out workloads when the ConfigMaps and
//! Secrets they consume change.
//!
//! ## Overview
//!
//! 1. **Watching resources** - Tracks content fingerprints of ConfigMaps and Secrets
//! 2. **Resolving dependents** - Finds Deployments, StatefulSets and DaemonSets that
//!    reference a changed resource through volumes, projected volumes, `env` or `envFrom`
//! 3. **Applying policy** - Honours the workload's reload annotations (auto, named,
//!    search/match, ignore, pause period, rollout strategy)
//! 4. **Triggering rollouts** - Patches the pod template on a bounded worker pool with retries
//! 5. **Notifying** - Records every reload decision in an audit log and forwards it to sinks
//!
//! ## Usage
//!
//! Configuration is read from environment variables, see [`config_reloader::config`].

use anyhow::Result;
use config_reloader::observability::otel::shutdown_otel;
use config_reloader::runtime::initialization::initialize;
use config_reloader::runtime::watch_loop::run_watch_loop;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on draining in-flight rollouts at shutdown
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    let result = run_watch_loop(
        init.client,
        Arc::clone(&init.reloader),
        &init.controller_config,
        Arc::clone(&init.server_state),
    )
    .await;

    // Dropping the reloader closes the rollout queue so the workers can drain
    drop(init.reloader);
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, init.dispatcher.join())
        .await
        .is_err()
    {
        warn!(
            "Rollout workers did not drain within {}s, exiting anyway",
            SHUTDOWN_DRAIN_TIMEOUT.as_secs()
        );
    }

    shutdown_otel(init.otel_tracer_provider);
    info!("Config Reloader stopped");
    result
}
