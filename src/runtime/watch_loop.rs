//! # Watch Loop
//!
//! Runs one watch task per (kind, namespace scope). Workload streams start
//! first and must finish their initial listing before ConfigMap and Secret
//! streams start, so the reverse index is complete by the time resource
//! changes can emit. Readiness is reported once every stream has listed.
//!
//! Each task keeps its watch state across stream restarts: a restarted stream
//! relists, and the state turns the relist into changes and deletions that
//! happened during the gap.

use crate::config::ControllerConfig;
use crate::controller::reloader::Reloader;
use crate::controller::server::ServerState;
use crate::controller::watcher::{
    ResourceSignal, ResourceWatchState, WatchScope, WorkloadSignal, WorkloadWatchState,
};
use crate::resources::identity::{ResourceKind, WorkloadKind};
use crate::resources::watched::ObservedResource;
use crate::resources::workload::ObservedWorkload;
use crate::runtime::error_policy::{handle_watch_stream_error, WatchErrorAction};
use anyhow::{bail, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use kube_runtime::watcher::{self, Event};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

type EventStream<T> = BoxStream<'static, Result<Event<T>, watcher::Error>>;

const WORKLOAD_KINDS: [WorkloadKind; 3] = [
    WorkloadKind::Deployment,
    WorkloadKind::StatefulSet,
    WorkloadKind::DaemonSet,
];
const RESOURCE_KINDS: [ResourceKind; 2] = [ResourceKind::ConfigMap, ResourceKind::Secret];

enum PipelineSignal {
    Resource(ResourceSignal),
    Workload(WorkloadSignal),
}

/// Watch state driven by one stream
trait StreamState: Send + 'static {
    type Object: Send + 'static;

    fn handle(&mut self, event: Event<Self::Object>) -> Vec<PipelineSignal>;

    fn is_synced(&self) -> bool;
}

impl StreamState for ResourceWatchState {
    type Object = ObservedResource;

    fn handle(&mut self, event: Event<ObservedResource>) -> Vec<PipelineSignal> {
        ResourceWatchState::handle(self, event)
            .into_iter()
            .map(PipelineSignal::Resource)
            .collect()
    }

    fn is_synced(&self) -> bool {
        ResourceWatchState::is_synced(self)
    }
}

impl StreamState for WorkloadWatchState {
    type Object = ObservedWorkload;

    fn handle(&mut self, event: Event<ObservedWorkload>) -> Vec<PipelineSignal> {
        WorkloadWatchState::handle(self, event)
            .into_iter()
            .map(PipelineSignal::Workload)
            .collect()
    }

    fn is_synced(&self) -> bool {
        WorkloadWatchState::is_synced(self)
    }
}

/// Shared by every stream task
#[derive(Clone)]
struct StreamContext {
    reloader: Arc<Reloader>,
    backoff_start_ms: u64,
    backoff_max_ms: u64,
    watch_restart_delay_secs: u64,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Run the controller watch loop until a shutdown signal arrives
pub async fn run_watch_loop(
    client: Client,
    reloader: Arc<Reloader>,
    config: &ControllerConfig,
    server_state: Arc<ServerState>,
) -> Result<()> {
    let scopes = config.watch_scopes();
    if scopes.is_empty() {
        bail!("Every namespace in WATCH_NAMESPACES is also in IGNORED_NAMESPACES, nothing to watch");
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let ctx = StreamContext {
        reloader: Arc::clone(&reloader),
        backoff_start_ms: config.backoff_start_ms,
        backoff_max_ms: config.backoff_max_ms,
        watch_restart_delay_secs: config.watch_restart_delay_secs,
        shutdown: Arc::clone(&shutdown_tx),
    };

    // Readiness fails as soon as SIGTERM or SIGINT arrives
    let shutdown_server_state = Arc::clone(&server_state);
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        shutdown_signal().await;
        request_shutdown(&shutdown_server_state, &signal_tx);
    });

    let mut tasks = JoinSet::new();
    let (synced_tx, mut synced_rx) = mpsc::channel::<String>(16);

    info!(
        scopes = scopes.len(),
        "Starting workload watches ({} streams)",
        scopes.len() * WORKLOAD_KINDS.len()
    );
    for scope in &scopes {
        for kind in WORKLOAD_KINDS {
            let label = format!("{}/{}", kind, scope.label());
            let state = WorkloadWatchState::new(Arc::clone(reloader.index()), kind, scope.clone());
            let events = {
                let client = client.clone();
                let scope = scope.clone();
                move || workload_events(&client, kind, &scope)
            };
            let span = watch_span(&label);
            tasks.spawn(
                run_stream(
                    label,
                    state,
                    events,
                    ctx.clone(),
                    synced_tx.clone(),
                    shutdown_rx.clone(),
                )
                .instrument(span),
            );
        }
    }
    let workload_streams = scopes.len() * WORKLOAD_KINDS.len();
    if !wait_for_sync(&mut synced_rx, workload_streams, &mut shutdown_rx).await {
        return drain(tasks).await;
    }
    info!(
        workloads = reloader.index().workload_count(),
        "Workload index built"
    );

    for scope in &scopes {
        for kind in RESOURCE_KINDS {
            let label = format!("{}/{}", kind, scope.label());
            let state = ResourceWatchState::new(
                Arc::clone(reloader.index()),
                kind,
                scope.clone(),
                config.reload_on_create,
            );
            let events = {
                let client = client.clone();
                let scope = scope.clone();
                let selector = config.resource_label_selector.clone();
                move || resource_events(&client, kind, &scope, selector.as_deref())
            };
            let span = watch_span(&label);
            tasks.spawn(
                run_stream(
                    label,
                    state,
                    events,
                    ctx.clone(),
                    synced_tx.clone(),
                    shutdown_rx.clone(),
                )
                .instrument(span),
            );
        }
    }
    let resource_streams = scopes.len() * RESOURCE_KINDS.len();
    if !wait_for_sync(&mut synced_rx, resource_streams, &mut shutdown_rx).await {
        return drain(tasks).await;
    }

    server_state.mark_ready();
    info!(
        resources = reloader.index().resource_count(),
        workloads = reloader.index().workload_count(),
        "Initial listings complete, controller is ready"
    );

    let _ = shutdown_rx.wait_for(|stop| *stop).await;
    drain(tasks).await
}

/// Resolve on SIGTERM (sent by the kubelet before SIGKILL) or SIGINT
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to register SIGTERM handler, only SIGINT stops the controller: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

/// Fail readiness and stop every stream
fn request_shutdown(server_state: &ServerState, shutdown: &watch::Sender<bool>) {
    info!("Initiating graceful shutdown...");
    server_state.mark_not_ready();
    let _ = shutdown.send(true);
}

/// Wait until `expected` streams reported their first sync; `false` on shutdown
async fn wait_for_sync(
    synced: &mut mpsc::Receiver<String>,
    expected: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut remaining = expected;
    while remaining > 0 {
        tokio::select! {
            label = synced.recv() => {
                let Some(label) = label else { return false };
                remaining -= 1;
                debug!(stream = label.as_str(), remaining, "Stream synced");
            }
            _ = shutdown.wait_for(|stop| *stop) => return false,
        }
    }
    true
}

async fn drain(mut tasks: JoinSet<()>) -> Result<()> {
    info!("Waiting for watch streams to stop...");
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!("Watch task ended abnormally: {}", e);
        }
    }
    info!("Watch loop stopped gracefully");
    Ok(())
}

fn watch_span(label: &str) -> tracing::Span {
    tracing::span!(tracing::Level::INFO, "controller.watch", stream = label)
}

async fn run_stream<S, F>(
    label: String,
    mut state: S,
    events: F,
    ctx: StreamContext,
    synced: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: StreamState,
    F: Fn() -> EventStream<S::Object> + Send + 'static,
{
    let backoff = Arc::new(AtomicU64::new(ctx.backoff_start_ms));
    let mut announced = false;

    'restart: loop {
        if *shutdown.borrow() {
            break;
        }
        info!("Starting watch stream {}", label);
        let mut stream = events();

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.changed() => break 'restart,
            };
            match next {
                Some(Ok(event)) => {
                    backoff.store(ctx.backoff_start_ms, std::sync::atomic::Ordering::Relaxed);
                    for signal in state.handle(event) {
                        if let Err(e) = dispatch(&ctx.reloader, signal).await {
                            error!(error = %e, "Pipeline stopped, shutting down watch {}", label);
                            let _ = ctx.shutdown.send(true);
                            break 'restart;
                        }
                    }
                    if !announced && state.is_synced() {
                        announced = true;
                        let _ = synced.send(label.clone()).await;
                    }
                }
                Some(Err(e)) => {
                    let error_string = format!("{e:?}");
                    match handle_watch_stream_error(
                        &label,
                        &error_string,
                        &backoff,
                        ctx.backoff_max_ms,
                        ctx.watch_restart_delay_secs,
                    )
                    .await
                    {
                        WatchErrorAction::Continue => {}
                        WatchErrorAction::Restart => continue 'restart,
                    }
                }
                None => {
                    warn!(
                        "Watch stream {} ended, restarting in {} seconds...",
                        label, ctx.watch_restart_delay_secs
                    );
                    tokio::time::sleep(Duration::from_secs(ctx.watch_restart_delay_secs)).await;
                    continue 'restart;
                }
            }
        }
    }
    debug!("Watch stream {} stopped", label);
}

async fn dispatch(
    reloader: &Reloader,
    signal: PipelineSignal,
) -> Result<(), crate::controller::reloader::ReloaderError> {
    match signal {
        PipelineSignal::Resource(signal) => reloader.handle_resource_signal(signal).await,
        PipelineSignal::Workload(signal) => {
            reloader.handle_workload_signal(signal);
            Ok(())
        }
    }
}

fn scoped_api<K>(client: &Client, scope: &WatchScope) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match scope.namespace.as_deref() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

fn resource_events(
    client: &Client,
    kind: ResourceKind,
    scope: &WatchScope,
    label_selector: Option<&str>,
) -> EventStream<ObservedResource> {
    let mut config = watcher::Config::default();
    if let Some(selector) = label_selector {
        config = config.labels(selector);
    }
    match kind {
        ResourceKind::ConfigMap => observe_events(
            scoped_api::<ConfigMap>(client, scope),
            config,
            ObservedResource::from_config_map,
        ),
        ResourceKind::Secret => observe_events(
            scoped_api::<Secret>(client, scope),
            config,
            ObservedResource::from_secret,
        ),
    }
}

fn workload_events(
    client: &Client,
    kind: WorkloadKind,
    scope: &WatchScope,
) -> EventStream<ObservedWorkload> {
    let config = watcher::Config::default();
    match kind {
        WorkloadKind::Deployment => observe_events(
            scoped_api::<Deployment>(client, scope),
            config,
            ObservedWorkload::from_deployment,
        ),
        WorkloadKind::StatefulSet => observe_events(
            scoped_api::<StatefulSet>(client, scope),
            config,
            ObservedWorkload::from_stateful_set,
        ),
        WorkloadKind::DaemonSet => observe_events(
            scoped_api::<DaemonSet>(client, scope),
            config,
            ObservedWorkload::from_daemon_set,
        ),
    }
}

/// Watch `api`, converting every object into the pipeline's observation type
fn observe_events<K, T, F>(api: Api<K>, config: watcher::Config, observe: F) -> EventStream<T>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as kube::Resource>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    T: Send + 'static,
    F: Fn(&K) -> Option<T> + Send + 'static,
{
    watcher::watcher(api, config)
        .filter_map(move |result| {
            let mapped = match result {
                Ok(event) => map_event(event, &observe).map(Ok),
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(mapped)
        })
        .boxed()
}

/// Objects that cannot be observed (no name or namespace) are dropped
fn map_event<K, T>(event: Event<K>, observe: impl Fn(&K) -> Option<T>) -> Option<Event<T>> {
    match event {
        Event::Init => Some(Event::Init),
        Event::InitDone => Some(Event::InitDone),
        Event::InitApply(object) => observe(&object).map(Event::InitApply),
        Event::Apply(object) => observe(&object).map(Event::Apply),
        Event::Delete(object) => observe(&object).map(Event::Delete),
    }
}
