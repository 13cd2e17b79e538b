//! # Workload API
//!
//! The narrow slice of the Kubernetes API the rollout trigger needs: read a
//! workload's pod template annotations and merge-patch them with an optimistic
//! concurrency precondition.

use crate::controller::trigger::TriggerError;
use crate::resources::identity::{WorkloadId, WorkloadKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// What the trigger needs to know about a workload before patching it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    pub resource_version: Option<String>,
    pub template_annotations: BTreeMap<String, String>,
}

/// Workload reads and pod template patches
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Current state of the workload, `None` if it no longer exists
    async fn get(&self, id: &WorkloadId) -> Result<Option<WorkloadSnapshot>, TriggerError>;

    /// Merge `annotations` into `spec.template.metadata.annotations`
    ///
    /// When `resource_version` is given the API server rejects the patch with
    /// a conflict if the workload changed since it was read.
    async fn patch_template_annotations(
        &self,
        id: &WorkloadId,
        annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<(), TriggerError>;
}

trait PodTemplated {
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
}

impl PodTemplated for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }
}

impl PodTemplated for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }
}

impl PodTemplated for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }
}

/// [`WorkloadApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeWorkloadApi {
    client: Client,
    field_manager: String,
}

impl Debug for KubeWorkloadApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWorkloadApi")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl KubeWorkloadApi {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_from<K>(api: Api<K>, name: &str) -> Result<Option<WorkloadSnapshot>, TriggerError>
    where
        K: kube::Resource + PodTemplated + Clone + DeserializeOwned + Debug,
    {
        let Some(object) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let template_annotations = object
            .pod_template()
            .and_then(|template| template.metadata.as_ref())
            .and_then(|metadata| metadata.annotations.clone())
            .unwrap_or_default();
        Ok(Some(WorkloadSnapshot {
            resource_version: kube::Resource::meta(&object).resource_version.clone(),
            template_annotations,
        }))
    }

    async fn patch_on<K>(
        &self,
        api: Api<K>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), TriggerError>
    where
        K: kube::Resource + Clone + DeserializeOwned + Debug,
    {
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        };
        api.patch(name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn get(&self, id: &WorkloadId) -> Result<Option<WorkloadSnapshot>, TriggerError> {
        match id.kind {
            WorkloadKind::Deployment => {
                Self::get_from(self.api::<Deployment>(&id.namespace), &id.name).await
            }
            WorkloadKind::StatefulSet => {
                Self::get_from(self.api::<StatefulSet>(&id.namespace), &id.name).await
            }
            WorkloadKind::DaemonSet => {
                Self::get_from(self.api::<DaemonSet>(&id.namespace), &id.name).await
            }
        }
    }

    async fn patch_template_annotations(
        &self,
        id: &WorkloadId,
        annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<(), TriggerError> {
        let patch = template_patch(annotations, resource_version);
        match id.kind {
            WorkloadKind::Deployment => {
                self.patch_on(self.api::<Deployment>(&id.namespace), &id.name, &patch)
                    .await
            }
            WorkloadKind::StatefulSet => {
                self.patch_on(self.api::<StatefulSet>(&id.namespace), &id.name, &patch)
                    .await
            }
            WorkloadKind::DaemonSet => {
                self.patch_on(self.api::<DaemonSet>(&id.namespace), &id.name, &patch)
                    .await
            }
        }
    }
}

/// JSON merge patch touching only pod template annotations
#[must_use]
pub fn template_patch(
    annotations: &BTreeMap<String, String>,
    resource_version: Option<&str>,
) -> serde_json::Value {
    let mut patch = json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": annotations
                }
            }
        }
    });
    if let Some(resource_version) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": resource_version });
    }
    patch
}
