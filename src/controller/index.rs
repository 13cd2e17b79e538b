//! # Resource Index
//!
//! Shared in-memory state of the controller: every watched ConfigMap/Secret,
//! every workload in scope, and a reverse index from resource to the workloads
//! that mention it.
//!
//! Resource state and workload state live behind separate reader/writer locks.
//! No lock is ever held across an `.await`; callers receive owned snapshots.
//! The reverse index is maintained incrementally as workloads come and go.

use crate::controller::fingerprint::Fingerprint;
use crate::controller::policy::{PolicyDefaults, PolicyError, ReloadPolicy};
use crate::observability::metrics;
use crate::resources::identity::{ResourceId, ResourceKind, WorkloadId, WorkloadKind};
use crate::resources::watched::{ObservedResource, WatchedResource};
use crate::resources::workload::{ObservedWorkload, WorkloadRef};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Result of recording a resource observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceUpdate {
    /// First observation of this identity
    Created,
    /// Payload fingerprint differs from the previous observation
    ContentChanged { previous: Fingerprint },
    /// Only metadata changed
    Unchanged,
}

/// Result of recording a workload observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadUpdate {
    pub created: bool,
    pub annotations_changed: bool,
}

#[derive(Debug, Default)]
struct WorkloadTable {
    workloads: HashMap<WorkloadId, WorkloadRef>,
    by_resource: HashMap<ResourceId, HashSet<WorkloadId>>,
    by_namespace: HashMap<String, HashSet<WorkloadId>>,
}

impl WorkloadTable {
    fn unlink(&mut self, workload: &WorkloadRef) {
        for resource in workload.references() {
            if let Some(dependents) = self.by_resource.get_mut(resource) {
                dependents.remove(&workload.id);
                if dependents.is_empty() {
                    self.by_resource.remove(resource);
                }
            }
        }
        if let Some(members) = self.by_namespace.get_mut(&workload.id.namespace) {
            members.remove(&workload.id);
            if members.is_empty() {
                self.by_namespace.remove(&workload.id.namespace);
            }
        }
    }

    fn link(&mut self, workload: &WorkloadRef) {
        for resource in workload.references() {
            self.by_resource
                .entry(resource.clone())
                .or_default()
                .insert(workload.id.clone());
        }
        self.by_namespace
            .entry(workload.id.namespace.clone())
            .or_default()
            .insert(workload.id.clone());
    }
}

/// Controller-owned index, shared by `Arc`
#[derive(Debug)]
pub struct ResourceIndex {
    defaults: PolicyDefaults,
    resources: RwLock<HashMap<ResourceId, WatchedResource>>,
    workloads: RwLock<WorkloadTable>,
    /// Workloads whose misconfiguration has already been reported
    misconfig_reported: Mutex<HashSet<WorkloadId>>,
}

impl ResourceIndex {
    #[must_use]
    pub fn new(defaults: PolicyDefaults) -> Self {
        Self {
            defaults,
            resources: RwLock::new(HashMap::new()),
            workloads: RwLock::new(WorkloadTable::default()),
            misconfig_reported: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn defaults(&self) -> &PolicyDefaults {
        &self.defaults
    }

    // Resources

    /// Record an observation; `lastSeenFingerprint` moves to the previous content fingerprint
    pub fn upsert_resource(&self, observed: ObservedResource) -> ResourceUpdate {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        let update = match resources.get_mut(&observed.id) {
            None => {
                resources.insert(observed.id.clone(), WatchedResource::new(observed));
                ResourceUpdate::Created
            }
            Some(existing) => {
                let previous = std::mem::replace(
                    &mut existing.content_fingerprint,
                    observed.fingerprint,
                );
                existing.annotations = observed.annotations;
                let changed = previous != existing.content_fingerprint;
                existing.last_seen_fingerprint = Some(previous.clone());
                if changed {
                    ResourceUpdate::ContentChanged { previous }
                } else {
                    ResourceUpdate::Unchanged
                }
            }
        };
        metrics::set_indexed_resources(i64::try_from(resources.len()).unwrap_or(i64::MAX));
        update
    }

    /// Stop tracking a resource
    pub fn remove_resource(&self, id: &ResourceId) -> Option<WatchedResource> {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        let removed = resources.remove(id);
        metrics::set_indexed_resources(i64::try_from(resources.len()).unwrap_or(i64::MAX));
        removed
    }

    #[must_use]
    pub fn resource(&self, id: &ResourceId) -> Option<WatchedResource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Tracked identities of one kind, optionally limited to a namespace
    #[must_use]
    pub fn resource_ids(&self, kind: ResourceKind, namespace: Option<&str>) -> Vec<ResourceId> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|id| id.kind == kind && namespace.is_none_or(|ns| id.namespace == ns))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // Workloads

    /// (Re)index one workload, touching only its own reverse-index entries
    pub fn upsert_workload(&self, observed: ObservedWorkload) -> WorkloadUpdate {
        let id = observed.id.clone();
        let mut table = self.workloads.write().unwrap_or_else(PoisonError::into_inner);
        let update = match table.workloads.remove(&id) {
            None => {
                let workload = WorkloadRef::new(observed, &self.defaults.keys);
                table.link(&workload);
                table.workloads.insert(id.clone(), workload);
                WorkloadUpdate {
                    created: true,
                    annotations_changed: true,
                }
            }
            Some(previous) => {
                let annotations_changed = previous.annotations != observed.annotations;
                table.unlink(&previous);
                let workload = previous.refreshed(observed, &self.defaults.keys);
                table.link(&workload);
                table.workloads.insert(id.clone(), workload);
                WorkloadUpdate {
                    created: false,
                    annotations_changed,
                }
            }
        };
        metrics::set_indexed_workloads(i64::try_from(table.workloads.len()).unwrap_or(i64::MAX));
        drop(table);

        if update.annotations_changed {
            self.misconfig_reported
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }
        update
    }

    pub fn remove_workload(&self, id: &WorkloadId) -> Option<WorkloadRef> {
        let mut table = self.workloads.write().unwrap_or_else(PoisonError::into_inner);
        let removed = table.workloads.remove(id);
        if let Some(workload) = &removed {
            table.unlink(workload);
        }
        metrics::set_indexed_workloads(i64::try_from(table.workloads.len()).unwrap_or(i64::MAX));
        drop(table);
        self.misconfig_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        removed
    }

    /// Tracked workload identities of one kind, optionally limited to a namespace
    #[must_use]
    pub fn workload_ids(&self, kind: WorkloadKind, namespace: Option<&str>) -> Vec<WorkloadId> {
        self.workloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workloads
            .keys()
            .filter(|id| id.kind == kind && namespace.is_none_or(|ns| id.namespace == ns))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn workload_count(&self) -> usize {
        self.workloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workloads
            .len()
    }

    /// Resolved policy of a workload (cached on the indexed entry)
    #[must_use]
    pub fn workload_policy(&self, id: &WorkloadId) -> Option<Result<Arc<ReloadPolicy>, PolicyError>> {
        self.workloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workloads
            .get(id)
            .map(|workload| workload.policy(&self.defaults))
    }

    /// Workloads whose annotations or pod template mention `resource`
    #[must_use]
    pub fn referencing(&self, resource: &ResourceId) -> Vec<WorkloadRef> {
        let table = self.workloads.read().unwrap_or_else(PoisonError::into_inner);
        table
            .by_resource
            .get(resource)
            .into_iter()
            .flatten()
            .filter_map(|id| table.workloads.get(id))
            .cloned()
            .collect()
    }

    /// Every workload in a namespace
    #[must_use]
    pub fn in_namespace(&self, namespace: &str) -> Vec<WorkloadRef> {
        let table = self.workloads.read().unwrap_or_else(PoisonError::into_inner);
        table
            .by_namespace
            .get(namespace)
            .into_iter()
            .flatten()
            .filter_map(|id| table.workloads.get(id))
            .cloned()
            .collect()
    }

    // Misconfiguration reporting

    /// Mark a workload's misconfiguration as reported; `true` the first time
    pub fn mark_misconfig_reported(&self, id: &WorkloadId) -> bool {
        self.misconfig_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fingerprint::ResourceContent;
    use crate::controller::policy::{AnnotationKeys, ReloadMode, RolloutStrategy};
    use std::collections::{BTreeMap, BTreeSet};

    fn index() -> ResourceIndex {
        ResourceIndex::new(PolicyDefaults {
            keys: AnnotationKeys::new("stakater.com"),
            auto_reload_all: false,
            strategy: RolloutStrategy::RolloutRestart,
        })
    }

    fn observed_resource(id: ResourceId, value: &str) -> ObservedResource {
        let mut content = ResourceContent::default();
        content.insert_text("LOG_LEVEL", value.as_bytes());
        ObservedResource {
            id,
            fingerprint: content.fingerprint(),
            annotations: BTreeMap::new(),
        }
    }

    fn observed_workload(
        name: &str,
        annotations: &[(&str, &str)],
        refs: &[ResourceId],
    ) -> ObservedWorkload {
        ObservedWorkload {
            id: WorkloadId::deployment("ns1", name),
            labels: BTreeMap::new(),
            annotations: annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            template_references: refs.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }

    mod resource_tests {
        use super::*;

        #[test]
        fn test_upsert_tracks_previous_fingerprint() {
            let index = index();
            let id = ResourceId::config_map("ns1", "app-config");

            assert_eq!(
                index.upsert_resource(observed_resource(id.clone(), "info")),
                ResourceUpdate::Created
            );
            assert_eq!(
                index.upsert_resource(observed_resource(id.clone(), "info")),
                ResourceUpdate::Unchanged
            );
            let update = index.upsert_resource(observed_resource(id.clone(), "debug"));
            assert!(matches!(update, ResourceUpdate::ContentChanged { .. }));

            let tracked = index.resource(&id).unwrap();
            assert_ne!(tracked.last_seen_fingerprint, Some(tracked.content_fingerprint.clone()));
        }

        #[test]
        fn test_resource_ids_by_scope() {
            let index = index();
            index.upsert_resource(observed_resource(ResourceId::config_map("ns1", "a"), "x"));
            index.upsert_resource(observed_resource(ResourceId::config_map("ns2", "b"), "x"));
            index.upsert_resource(observed_resource(ResourceId::secret("ns1", "c"), "x"));

            assert_eq!(index.resource_ids(ResourceKind::ConfigMap, None).len(), 2);
            assert_eq!(
                index.resource_ids(ResourceKind::ConfigMap, Some("ns1")),
                vec![ResourceId::config_map("ns1", "a")]
            );
            assert!(index.remove_resource(&ResourceId::secret("ns1", "c")).is_some());
            assert_eq!(index.resource_count(), 2);
        }
    }

    mod workload_tests {
        use super::*;

        #[test]
        fn test_reverse_index_is_incremental() {
            let index = index();
            let config = ResourceId::config_map("ns1", "app-config");
            let secret = ResourceId::secret("ns1", "db-creds");

            index.upsert_workload(observed_workload("api", &[], &[config.clone()]));
            assert_eq!(index.referencing(&config).len(), 1);
            assert!(index.referencing(&secret).is_empty());

            // Pod template now mounts the Secret instead of the ConfigMap.
            index.upsert_workload(observed_workload("api", &[], &[secret.clone()]));
            assert!(index.referencing(&config).is_empty());
            assert_eq!(index.referencing(&secret).len(), 1);

            index.remove_workload(&WorkloadId::deployment("ns1", "api"));
            assert!(index.referencing(&secret).is_empty());
            assert_eq!(index.workload_count(), 0);
        }

        #[test]
        fn test_referencing_carries_reference_kind_and_policy() {
            let index = index();
            let secret = ResourceId::secret("ns1", "db-creds");
            index.upsert_workload(observed_workload(
                "worker",
                &[("secret.reloader.stakater.com/reload", "db-creds")],
                &[],
            ));

            let workloads = index.referencing(&secret);
            assert_eq!(workloads.len(), 1);
            assert!(workloads[0].explicit.contains(&secret));
            assert!(!workloads[0].implicit.contains(&secret));
            assert_eq!(
                workloads[0].policy(index.defaults()).unwrap().mode,
                ReloadMode::Named
            );
        }

        #[test]
        fn test_in_namespace_lists_all_workloads() {
            let index = index();
            let config = ResourceId::config_map("ns1", "shared");
            index.upsert_workload(observed_workload("a", &[], &[]));
            index.upsert_workload(observed_workload("b", &[], &[config.clone()]));
            assert_eq!(index.in_namespace("ns1").len(), 2);
            assert!(index.in_namespace("ns2").is_empty());
        }

        #[test]
        fn test_misconfig_reported_once_until_annotations_change() {
            let index = index();
            let id = WorkloadId::deployment("ns1", "api");
            let broken = [("reloader.stakater.com/pause-period", "soon")];

            index.upsert_workload(observed_workload("api", &broken, &[]));
            assert!(index.mark_misconfig_reported(&id));
            assert!(!index.mark_misconfig_reported(&id));

            // Spec-only update keeps the marker.
            let update = index.upsert_workload(observed_workload("api", &broken, &[]));
            assert!(!update.annotations_changed);
            assert!(!index.mark_misconfig_reported(&id));

            let update = index.upsert_workload(observed_workload(
                "api",
                &[("reloader.stakater.com/pause-period", "later")],
                &[],
            ));
            assert!(update.annotations_changed);
            assert!(index.mark_misconfig_reported(&id));
        }
    }
}
