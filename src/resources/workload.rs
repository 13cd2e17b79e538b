//! # Workloads
//!
//! Deployments, StatefulSets and DaemonSets as seen by the dependency resolver:
//! identity, labels, annotations, explicit (annotation) references and implicit
//! (pod template) references.

use crate::controller::policy::{
    named_references, AnnotationKeys, PolicyDefaults, PolicyError, ReloadMode, ReloadPolicy,
};
use crate::resources::identity::{ResourceId, ResourceKind, WorkloadId, WorkloadKind};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

/// Snapshot of a workload as observed by the workload watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedWorkload {
    pub id: WorkloadId,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// ConfigMaps/Secrets referenced from the pod template
    pub template_references: BTreeSet<ResourceId>,
}

impl ObservedWorkload {
    #[must_use]
    pub fn from_deployment(deployment: &Deployment) -> Option<Self> {
        let template = deployment.spec.as_ref().map(|spec| &spec.template);
        Self::build(
            WorkloadKind::Deployment,
            &deployment.metadata,
            template,
        )
    }

    #[must_use]
    pub fn from_stateful_set(stateful_set: &StatefulSet) -> Option<Self> {
        let template = stateful_set.spec.as_ref().map(|spec| &spec.template);
        Self::build(
            WorkloadKind::StatefulSet,
            &stateful_set.metadata,
            template,
        )
    }

    #[must_use]
    pub fn from_daemon_set(daemon_set: &DaemonSet) -> Option<Self> {
        let template = daemon_set.spec.as_ref().map(|spec| &spec.template);
        Self::build(WorkloadKind::DaemonSet, &daemon_set.metadata, template)
    }

    fn build(
        kind: WorkloadKind,
        metadata: &kube::api::ObjectMeta,
        template: Option<&PodTemplateSpec>,
    ) -> Option<Self> {
        let name = metadata.name.as_deref()?;
        let namespace = metadata.namespace.as_deref()?;
        Some(Self {
            id: WorkloadId::new(kind, namespace, name),
            labels: metadata.labels.clone().unwrap_or_default(),
            annotations: metadata.annotations.clone().unwrap_or_default(),
            template_references: template
                .map(|t| template_references(namespace, t))
                .unwrap_or_default(),
        })
    }
}

/// ConfigMaps and Secrets a pod template consumes
///
/// Covers `env[].valueFrom`, `envFrom[]`, `volumes[].configMap|secret` and
/// projected volume sources, for both containers and init containers.
#[must_use]
pub fn template_references(namespace: &str, template: &PodTemplateSpec) -> BTreeSet<ResourceId> {
    let mut refs = BTreeSet::new();
    let Some(spec) = &template.spec else {
        return refs;
    };

    let mut add = |kind: ResourceKind, name: &str| {
        if !name.is_empty() {
            refs.insert(ResourceId::new(kind, namespace, name));
        }
    };

    let containers = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten());
    for container in containers {
        container_references(container, &mut add);
    }

    for volume in spec.volumes.iter().flatten() {
        if let Some(config_map) = &volume.config_map {
            add(ResourceKind::ConfigMap, &config_map.name);
        }
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.as_deref()) {
            add(ResourceKind::Secret, name);
        }
        let projections = volume
            .projected
            .as_ref()
            .and_then(|p| p.sources.as_ref())
            .into_iter()
            .flatten();
        for projection in projections {
            if let Some(config_map) = &projection.config_map {
                add(ResourceKind::ConfigMap, &config_map.name);
            }
            if let Some(secret) = &projection.secret {
                add(ResourceKind::Secret, &secret.name);
            }
        }
    }

    refs
}

fn container_references(container: &Container, add: &mut impl FnMut(ResourceKind, &str)) {
    for env in container.env.iter().flatten() {
        let Some(source) = &env.value_from else {
            continue;
        };
        if let Some(selector) = &source.config_map_key_ref {
            add(ResourceKind::ConfigMap, &selector.name);
        }
        if let Some(selector) = &source.secret_key_ref {
            add(ResourceKind::Secret, &selector.name);
        }
    }
    for env_from in container.env_from.iter().flatten() {
        if let Some(config_map) = &env_from.config_map_ref {
            add(ResourceKind::ConfigMap, &config_map.name);
        }
        if let Some(secret) = &env_from.secret_ref {
            add(ResourceKind::Secret, &secret.name);
        }
    }
}

/// Indexed state of one workload
///
/// The resolved [`ReloadPolicy`] is computed on first use and cached; the cache
/// is carried across updates that leave the annotations untouched.
#[derive(Debug, Clone)]
pub struct WorkloadRef {
    pub id: WorkloadId,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Resources named by reload annotations
    pub explicit: BTreeSet<ResourceId>,
    /// Resources referenced by the pod template
    pub implicit: BTreeSet<ResourceId>,
    policy: OnceLock<Result<Arc<ReloadPolicy>, PolicyError>>,
}

impl WorkloadRef {
    #[must_use]
    pub fn new(observed: ObservedWorkload, keys: &AnnotationKeys) -> Self {
        let explicit = named_references(&observed.id.namespace, &observed.annotations, keys);
        Self {
            id: observed.id,
            labels: observed.labels,
            annotations: observed.annotations,
            explicit,
            implicit: observed.template_references,
            policy: OnceLock::new(),
        }
    }

    /// Apply a newer observation, keeping the cached policy if annotations are unchanged
    #[must_use]
    pub fn refreshed(self, observed: ObservedWorkload, keys: &AnnotationKeys) -> Self {
        let annotations_unchanged = self.annotations == observed.annotations;
        let mut next = Self::new(observed, keys);
        if annotations_unchanged {
            next.policy = self.policy;
        }
        next
    }

    /// Resolved policy, parsed on first call
    pub fn policy(&self, defaults: &PolicyDefaults) -> Result<Arc<ReloadPolicy>, PolicyError> {
        self.policy
            .get_or_init(|| {
                ReloadPolicy::from_annotations(&self.id.namespace, &self.annotations, defaults)
                    .map(Arc::new)
            })
            .clone()
    }

    /// Every resource this workload mentions, effective or not (reverse index keys)
    pub fn references(&self) -> impl Iterator<Item = &ResourceId> {
        self.explicit.iter().chain(self.implicit.iter())
    }

    /// Whether `resource` is in the effective `dependsOn` under the resolved policy
    ///
    /// Disabled or misconfigured workloads depend on nothing. Explicit
    /// references always count otherwise. Implicit ones count in auto mode for
    /// the kinds it covers, and in search-match mode when the resource opted in
    /// with `reloader.<domain>/match`.
    #[must_use]
    pub fn depends_on(&self, resource: &ResourceId, match_opt_in: bool, defaults: &PolicyDefaults) -> bool {
        let Ok(policy) = self.policy(defaults) else {
            return false;
        };
        let explicit = self.explicit.contains(resource);
        let implicit = self.implicit.contains(resource);
        match policy.mode {
            ReloadMode::Disabled => false,
            ReloadMode::Named => explicit,
            ReloadMode::Auto => explicit || (implicit && policy.honours_implicit(resource.kind)),
            ReloadMode::SearchMatch => explicit || (implicit && match_opt_in),
        }
    }

    /// Whether every `(label, value)` pair is present on the workload
    pub fn matches_labels<'a>(&self, mut selector: impl Iterator<Item = (&'a str, &'a str)>) -> bool {
        selector.all(|(label, value)| self.labels.get(label).map(String::as_str) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::policy::RolloutStrategy;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, ConfigMapKeySelector, ConfigMapProjection, ConfigMapVolumeSource,
        EnvFromSource, EnvVar, EnvVarSource, PodSpec, ProjectedVolumeSource, SecretKeySelector,
        SecretProjection, SecretVolumeSource, Volume, VolumeProjection,
    };
    use kube::api::ObjectMeta;

    fn defaults() -> PolicyDefaults {
        PolicyDefaults {
            keys: AnnotationKeys::new("stakater.com"),
            auto_reload_all: false,
            strategy: RolloutStrategy::RolloutRestart,
        }
    }

    fn deployment(annotations: &[(&str, &str)], spec: PodSpec) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("ns1".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn full_pod_spec() -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                env: Some(vec![
                    EnvVar {
                        name: "LOG_LEVEL".to_string(),
                        value_from: Some(EnvVarSource {
                            config_map_key_ref: Some(ConfigMapKeySelector {
                                name: "env-config".to_string(),
                                key: "LOG_LEVEL".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "DB_PASSWORD".to_string(),
                        value_from: Some(EnvVarSource {
                            secret_key_ref: Some(SecretKeySelector {
                                name: "db-creds".to_string(),
                                key: "password".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                env_from: Some(vec![EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: "bulk-env".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            init_containers: Some(vec![Container {
                name: "migrate".to_string(),
                env_from: Some(vec![EnvFromSource {
                    secret_ref: Some(k8s_openapi::api::core::v1::SecretEnvSource {
                        name: "migrate-creds".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            volumes: Some(vec![
                Volume {
                    name: "config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: "app-config".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "tls".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some("tls-cert".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "bundle".to_string(),
                    projected: Some(ProjectedVolumeSource {
                        sources: Some(vec![
                            VolumeProjection {
                                config_map: Some(ConfigMapProjection {
                                    name: "projected-config".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            VolumeProjection {
                                secret: Some(SecretProjection {
                                    name: "projected-secret".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_template_references_cover_all_sources() {
        let observed = ObservedWorkload::from_deployment(&deployment(&[], full_pod_spec())).unwrap();
        let expected: BTreeSet<ResourceId> = [
            ResourceId::config_map("ns1", "env-config"),
            ResourceId::secret("ns1", "db-creds"),
            ResourceId::config_map("ns1", "bulk-env"),
            ResourceId::secret("ns1", "migrate-creds"),
            ResourceId::config_map("ns1", "app-config"),
            ResourceId::secret("ns1", "tls-cert"),
            ResourceId::config_map("ns1", "projected-config"),
            ResourceId::secret("ns1", "projected-secret"),
        ]
        .into_iter()
        .collect();
        assert_eq!(observed.template_references, expected);
    }

    #[test]
    fn test_workload_without_name_is_skipped() {
        let mut d = deployment(&[], PodSpec::default());
        d.metadata.name = None;
        assert!(ObservedWorkload::from_deployment(&d).is_none());
    }

    fn workload(annotations: &[(&str, &str)]) -> WorkloadRef {
        let observed = ObservedWorkload::from_deployment(&deployment(annotations, full_pod_spec())).unwrap();
        WorkloadRef::new(observed, &defaults().keys)
    }

    #[test]
    fn test_depends_on_disabled_is_empty() {
        let workload = workload(&[("reloader.stakater.com/auto", "false")]);
        assert!(workload.references().next().is_some());
        assert!(!workload
            .references()
            .any(|id| workload.depends_on(id, true, &defaults())));
    }

    #[test]
    fn test_depends_on_named_ignores_implicit() {
        let workload = workload(&[("secret.reloader.stakater.com/reload", "db-creds")]);
        assert!(workload.depends_on(&ResourceId::secret("ns1", "db-creds"), false, &defaults()));
        assert!(!workload.depends_on(&ResourceId::secret("ns1", "tls-cert"), true, &defaults()));
        assert!(!workload.depends_on(&ResourceId::config_map("ns1", "app-config"), true, &defaults()));
    }

    #[test]
    fn test_depends_on_auto_includes_implicit() {
        let workload = workload(&[("reloader.stakater.com/auto", "true")]);
        assert!(workload
            .references()
            .all(|id| workload.depends_on(id, false, &defaults())));
        assert!(!workload.depends_on(&ResourceId::config_map("ns1", "unrelated"), false, &defaults()));

        let secrets_only = self::workload(&[("secret.reloader.stakater.com/auto", "true")]);
        assert!(secrets_only.depends_on(&ResourceId::secret("ns1", "tls-cert"), false, &defaults()));
        assert!(!secrets_only.depends_on(&ResourceId::config_map("ns1", "app-config"), false, &defaults()));
    }

    #[test]
    fn test_depends_on_search_requires_resource_opt_in() {
        let workload = workload(&[("reloader.stakater.com/search", "true")]);
        let config = ResourceId::config_map("ns1", "app-config");
        assert!(workload.depends_on(&config, true, &defaults()));
        assert!(!workload.depends_on(&config, false, &defaults()));
    }

    #[test]
    fn test_policy_cache_survives_spec_only_update() {
        let keys = defaults().keys;
        let annotations = [("reloader.stakater.com/auto", "true")];
        let first = WorkloadRef::new(
            ObservedWorkload::from_deployment(&deployment(&annotations, PodSpec::default())).unwrap(),
            &keys,
        );
        let cached = first.policy(&defaults()).unwrap();

        let refreshed = first.clone().refreshed(
            ObservedWorkload::from_deployment(&deployment(&annotations, full_pod_spec())).unwrap(),
            &keys,
        );
        assert!(Arc::ptr_eq(&cached, &refreshed.policy(&defaults()).unwrap()));

        let changed = refreshed.refreshed(
            ObservedWorkload::from_deployment(&deployment(
                &[("reloader.stakater.com/auto", "false")],
                full_pod_spec(),
            ))
            .unwrap(),
            &keys,
        );
        let reparsed = changed.policy(&defaults()).unwrap();
        assert!(!Arc::ptr_eq(&cached, &reparsed));
        assert_eq!(reparsed.mode, ReloadMode::Disabled);
    }

    #[test]
    fn test_matches_labels() {
        let mut observed =
            ObservedWorkload::from_deployment(&deployment(&[], PodSpec::default())).unwrap();
        observed.labels.insert("app".to_string(), "web".to_string());
        let workload = WorkloadRef::new(observed, &defaults().keys);
        assert!(workload.matches_labels([("app", "web")].into_iter()));
        assert!(!workload.matches_labels([("app", "api")].into_iter()));
        assert!(!workload.matches_labels([("tier", "web")].into_iter()));
    }
}
