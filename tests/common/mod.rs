//! Common test utilities for pipeline integration tests
//!
//! Provides Kubernetes object fixtures, an in-memory [`WorkloadApi`] and a
//! [`Pipeline`] that wires the real index, watch states, reloader, rollout
//! workers and notifier together without an API server.

#![allow(dead_code, reason = "each test binary uses a different subset of helpers")]

use async_trait::async_trait;
use config_reloader::controller::index::ResourceIndex;
use config_reloader::controller::notifier::Notifier;
use config_reloader::controller::policy::{AnnotationKeys, PolicyDefaults, RolloutStrategy};
use config_reloader::controller::reloader::Reloader;
use config_reloader::controller::trigger::{
    Dispatcher, RolloutSettings, RolloutTrigger, TriggerError, WorkloadApi, WorkloadSnapshot,
};
use config_reloader::controller::watcher::{
    ResourceWatchState, WatchScope, WorkloadWatchState,
};
use config_reloader::resources::event::ReloadEvent;
use config_reloader::resources::identity::{ResourceKind, WorkloadId, WorkloadKind};
use config_reloader::resources::watched::ObservedResource;
use config_reloader::resources::workload::ObservedWorkload;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube_runtime::watcher::Event;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DOMAIN: &str = "stakater.com";

fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn config_map(
    namespace: &str,
    name: &str,
    data: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> ConfigMap {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "annotations": string_map(annotations),
        },
        "data": string_map(data),
    }))
    .expect("valid ConfigMap")
}

pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    let mut secret: Secret = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name, "namespace": namespace },
    }))
    .expect("valid Secret");
    secret.string_data = Some(string_map(data));
    secret
}

/// Deployment mounting `config_maps` as volumes and reading `secrets` via `envFrom`
pub fn deployment(
    namespace: &str,
    name: &str,
    annotations: &[(&str, &str)],
    config_maps: &[&str],
    secrets: &[&str],
) -> Deployment {
    let volumes: Vec<_> = config_maps
        .iter()
        .map(|cm| json!({ "name": format!("{cm}-volume"), "configMap": { "name": cm } }))
        .collect();
    let env_from: Vec<_> = secrets
        .iter()
        .map(|s| json!({ "secretRef": { "name": s } }))
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "annotations": string_map(annotations),
        },
        "spec": {
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": "registry.local/app:1.0.0",
                        "envFrom": env_from,
                    }],
                    "volumes": volumes,
                }
            }
        }
    }))
    .expect("valid Deployment")
}

/// Set metadata labels on a workload fixture
pub fn with_labels(mut deployment: Deployment, labels: &[(&str, &str)]) -> Deployment {
    deployment.metadata.labels = Some(string_map(labels));
    deployment
}

/// Patch recorded by [`FakeWorkloadApi`]
#[derive(Debug, Clone)]
pub struct RecordedPatch {
    pub workload: WorkloadId,
    pub annotations: BTreeMap<String, String>,
}

/// In-memory workloads with resource-version bookkeeping
#[derive(Debug, Default)]
pub struct FakeWorkloadApi {
    workloads: Mutex<HashMap<WorkloadId, WorkloadSnapshot>>,
    patches: Mutex<Vec<RecordedPatch>>,
}

impl FakeWorkloadApi {
    pub fn register(&self, id: WorkloadId) {
        self.workloads
            .lock()
            .expect("workloads lock")
            .entry(id)
            .or_insert_with(|| WorkloadSnapshot {
                resource_version: Some("1".to_string()),
                template_annotations: BTreeMap::new(),
            });
    }

    pub fn forget(&self, id: &WorkloadId) {
        self.workloads.lock().expect("workloads lock").remove(id);
    }

    pub fn patches(&self) -> Vec<RecordedPatch> {
        self.patches.lock().expect("patches lock").clone()
    }

    pub fn template_annotations(&self, id: &WorkloadId) -> BTreeMap<String, String> {
        self.workloads
            .lock()
            .expect("workloads lock")
            .get(id)
            .map(|w| w.template_annotations.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkloadApi for FakeWorkloadApi {
    async fn get(&self, id: &WorkloadId) -> Result<Option<WorkloadSnapshot>, TriggerError> {
        Ok(self.workloads.lock().expect("workloads lock").get(id).cloned())
    }

    async fn patch_template_annotations(
        &self,
        id: &WorkloadId,
        annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<(), TriggerError> {
        let mut workloads = self.workloads.lock().expect("workloads lock");
        let Some(workload) = workloads.get_mut(id) else {
            return Err(TriggerError::NotFound);
        };
        if resource_version.is_some() && resource_version != workload.resource_version.as_deref() {
            return Err(TriggerError::Conflict("resource version changed".to_string()));
        }
        workload
            .template_annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        let next = workload
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        workload.resource_version = Some(next.to_string());
        self.patches.lock().expect("patches lock").push(RecordedPatch {
            workload: id.clone(),
            annotations: annotations.clone(),
        });
        Ok(())
    }
}

/// The reload pipeline over one namespace-less scope, fed by hand
pub struct Pipeline {
    pub reloader: Arc<Reloader>,
    pub api: Arc<FakeWorkloadApi>,
    pub keys: AnnotationKeys,
    dispatcher: Dispatcher,
    config_maps: ResourceWatchState,
    secrets: ResourceWatchState,
    deployments: WorkloadWatchState,
}

impl Pipeline {
    /// Build the pipeline and run the initial listings: workloads first, then resources
    pub async fn start(
        workloads: &[Deployment],
        config_maps: &[ConfigMap],
        secrets: &[Secret],
    ) -> Self {
        let keys = AnnotationKeys::new(DOMAIN);
        let index = Arc::new(ResourceIndex::new(PolicyDefaults {
            keys: keys.clone(),
            auto_reload_all: false,
            strategy: RolloutStrategy::RolloutRestart,
        }));
        let notifier = Notifier::new(1000, Vec::new(), Duration::from_secs(1));
        let api = Arc::new(FakeWorkloadApi::default());
        let trigger = Arc::new(RolloutTrigger::new(
            Arc::clone(&api) as Arc<dyn WorkloadApi>,
            keys.clone(),
            RolloutSettings {
                max_attempts: 3,
                attempt_timeout: Duration::from_secs(5),
                backoff_start_ms: 100,
                backoff_max_ms: 1_000,
            },
        ));
        let (queue, dispatcher) = Dispatcher::start(64, 4, trigger, notifier.clone());
        let reloader = Arc::new(Reloader::new(Arc::clone(&index), queue, notifier));

        let mut pipeline = Self {
            reloader,
            api,
            keys,
            dispatcher,
            config_maps: ResourceWatchState::new(
                Arc::clone(&index),
                ResourceKind::ConfigMap,
                WatchScope::default(),
                false,
            ),
            secrets: ResourceWatchState::new(
                Arc::clone(&index),
                ResourceKind::Secret,
                WatchScope::default(),
                false,
            ),
            deployments: WorkloadWatchState::new(
                index,
                WorkloadKind::Deployment,
                WatchScope::default(),
            ),
        };

        pipeline.workload_event(Event::Init);
        for deployment in workloads {
            let observed = ObservedWorkload::from_deployment(deployment).expect("named deployment");
            pipeline.api.register(observed.id.clone());
            pipeline.workload_event(Event::InitApply(observed));
        }
        pipeline.workload_event(Event::InitDone);

        pipeline.config_map_event(Event::Init).await;
        for config_map in config_maps {
            let observed = ObservedResource::from_config_map(config_map).expect("named ConfigMap");
            pipeline.config_map_event(Event::InitApply(observed)).await;
        }
        pipeline.config_map_event(Event::InitDone).await;

        pipeline.secret_event(Event::Init).await;
        for secret in secrets {
            let observed = ObservedResource::from_secret(secret).expect("named Secret");
            pipeline.secret_event(Event::InitApply(observed)).await;
        }
        pipeline.secret_event(Event::InitDone).await;

        pipeline
    }

    fn workload_event(&mut self, event: Event<ObservedWorkload>) {
        for signal in self.deployments.handle(event) {
            self.reloader.handle_workload_signal(signal);
        }
    }

    async fn config_map_event(&mut self, event: Event<ObservedResource>) {
        for signal in self.config_maps.handle(event) {
            self.reloader
                .handle_resource_signal(signal)
                .await
                .expect("rollout queue open");
        }
    }

    async fn secret_event(&mut self, event: Event<ObservedResource>) {
        for signal in self.secrets.handle(event) {
            self.reloader
                .handle_resource_signal(signal)
                .await
                .expect("rollout queue open");
        }
    }

    pub fn apply_deployment(&mut self, deployment: &Deployment) {
        let observed = ObservedWorkload::from_deployment(deployment).expect("named deployment");
        self.api.register(observed.id.clone());
        self.workload_event(Event::Apply(observed));
    }

    pub fn delete_deployment(&mut self, deployment: &Deployment) {
        let observed = ObservedWorkload::from_deployment(deployment).expect("named deployment");
        self.api.forget(&observed.id);
        self.workload_event(Event::Delete(observed));
    }

    pub async fn apply_config_map(&mut self, config_map: &ConfigMap) {
        let observed = ObservedResource::from_config_map(config_map).expect("named ConfigMap");
        self.config_map_event(Event::Apply(observed)).await;
    }

    pub async fn apply_secret(&mut self, secret: &Secret) {
        let observed = ObservedResource::from_secret(secret).expect("named Secret");
        self.secret_event(Event::Apply(observed)).await;
    }

    pub async fn delete_secret(&mut self, secret: &Secret) {
        let observed = ObservedResource::from_secret(secret).expect("named Secret");
        self.secret_event(Event::Delete(observed)).await;
    }

    pub fn events(&self) -> Vec<ReloadEvent> {
        self.reloader.notifier().reload_events()
    }

    /// Poll until at least `count` reload events were recorded
    pub async fn wait_for_events(&self, count: usize) -> Vec<ReloadEvent> {
        for _ in 0..500 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} reload events, got {:?}",
            self.events()
        );
    }

    /// Let in-flight rollouts finish, then report everything recorded
    pub async fn settle(&self) -> Vec<ReloadEvent> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.events()
    }

    /// Close the rollout queue and wait for the workers
    pub async fn shutdown(self) {
        let Self {
            reloader,
            dispatcher,
            ..
        } = self;
        drop(reloader);
        dispatcher.join().await;
    }
}
