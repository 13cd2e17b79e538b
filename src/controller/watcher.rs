//! # Watch State
//!
//! Turns raw watch events into pipeline inputs.
//!
//! One [`ResourceWatchState`] exists per (kind, namespace scope) watch stream.
//! The first listing seeds fingerprints silently. After that, live updates
//! emit a [`ResourceChanged`] only when the content fingerprint moved. A
//! relist (after the stream was restarted) emits for every resource whose
//! content changed during the gap and reports resources that vanished during
//! the gap as deleted.
//!
//! [`WorkloadWatchState`] does the same bookkeeping for one workload kind.

use crate::controller::index::{ResourceIndex, ResourceUpdate, WorkloadUpdate};
use crate::observability::metrics;
use crate::resources::identity::{ResourceId, ResourceKind, WorkloadId, WorkloadKind};
use crate::resources::watched::{ObservedResource, ResourceChanged, WatchedResource};
use crate::resources::workload::ObservedWorkload;
use kube_runtime::watcher::Event;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Namespaces a watch stream covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchScope {
    /// `None` watches every namespace
    pub namespace: Option<String>,
    pub ignored_namespaces: BTreeSet<String>,
}

impl WatchScope {
    #[must_use]
    pub fn all(ignored_namespaces: BTreeSet<String>) -> Self {
        Self {
            namespace: None,
            ignored_namespaces,
        }
    }

    #[must_use]
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ignored_namespaces: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn admits(&self, namespace: &str) -> bool {
        !self.ignored_namespaces.contains(namespace)
            && self.namespace.as_deref().is_none_or(|ns| ns == namespace)
    }

    /// Label used in logs and metrics
    #[must_use]
    pub fn label(&self) -> &str {
        self.namespace.as_deref().unwrap_or("*")
    }
}

/// Pipeline input produced by a resource watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSignal {
    Changed(ResourceChanged),
    /// Last tracked state of a resource that is gone
    Deleted(WatchedResource),
}

/// Per-stream state for ConfigMap or Secret watches
#[derive(Debug)]
pub struct ResourceWatchState {
    index: Arc<ResourceIndex>,
    kind: ResourceKind,
    scope: WatchScope,
    reload_on_create: bool,
    /// Set once the initial listing completed
    synced: bool,
    /// Identities seen by the listing in progress
    listing: Option<HashSet<ResourceId>>,
}

impl ResourceWatchState {
    #[must_use]
    pub fn new(
        index: Arc<ResourceIndex>,
        kind: ResourceKind,
        scope: WatchScope,
        reload_on_create: bool,
    ) -> Self {
        Self {
            index,
            kind,
            scope,
            reload_on_create,
            synced: false,
            listing: None,
        }
    }

    /// Whether the initial listing has completed
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Apply one watch event, returning what the pipeline must react to
    pub fn handle(&mut self, event: Event<ObservedResource>) -> Vec<ResourceSignal> {
        match event {
            Event::Init => {
                debug!(kind = %self.kind, scope = self.scope.label(), "watch.listing.started");
                self.listing = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(observed) => {
                if !self.scope.admits(&observed.id.namespace) {
                    return Vec::new();
                }
                if let Some(listing) = self.listing.as_mut() {
                    listing.insert(observed.id.clone());
                }
                metrics::increment_resource_events(self.kind.as_str(), "list");
                // The first listing only seeds fingerprints.
                let emit = self.synced;
                self.observe(observed, emit).into_iter().collect()
            }
            Event::InitDone => self.finish_listing(),
            Event::Apply(observed) => {
                if !self.scope.admits(&observed.id.namespace) {
                    return Vec::new();
                }
                metrics::increment_resource_events(self.kind.as_str(), "apply");
                self.observe(observed, true).into_iter().collect()
            }
            Event::Delete(observed) => {
                if !self.scope.admits(&observed.id.namespace) {
                    return Vec::new();
                }
                metrics::increment_resource_events(self.kind.as_str(), "delete");
                self.index
                    .remove_resource(&observed.id)
                    .map(ResourceSignal::Deleted)
                    .into_iter()
                    .collect()
            }
        }
    }

    fn observe(&self, observed: ObservedResource, emit: bool) -> Option<ResourceSignal> {
        let id = observed.id.clone();
        let new_fingerprint = observed.fingerprint.clone();
        let update = self.index.upsert_resource(observed);
        if !emit {
            return None;
        }
        let old_fingerprint = match update {
            ResourceUpdate::Unchanged => {
                debug!(resource = %id, "Metadata-only update, content unchanged");
                return None;
            }
            ResourceUpdate::Created if !self.reload_on_create => return None,
            ResourceUpdate::Created => None,
            ResourceUpdate::ContentChanged { previous } => Some(previous),
        };
        metrics::increment_content_changes(self.kind.as_str());
        Some(ResourceSignal::Changed(ResourceChanged {
            id,
            old_fingerprint,
            new_fingerprint,
        }))
    }

    fn finish_listing(&mut self) -> Vec<ResourceSignal> {
        let seen = self.listing.take().unwrap_or_default();
        let vanished: Vec<ResourceId> = self
            .index
            .resource_ids(self.kind, self.scope.namespace.as_deref())
            .into_iter()
            .filter(|id| self.scope.admits(&id.namespace) && !seen.contains(id))
            .collect();

        if self.synced {
            info!(
                kind = %self.kind,
                scope = self.scope.label(),
                listed = seen.len(),
                vanished = vanished.len(),
                "Relist completed"
            );
        } else {
            info!(
                kind = %self.kind,
                scope = self.scope.label(),
                listed = seen.len(),
                "Initial listing completed, fingerprints seeded"
            );
        }
        self.synced = true;

        vanished
            .into_iter()
            .filter_map(|id| self.index.remove_resource(&id))
            .map(ResourceSignal::Deleted)
            .collect()
    }
}

/// Pipeline input produced by a workload watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadSignal {
    Applied(WorkloadId, WorkloadUpdate),
    Deleted(WorkloadId),
}

/// Per-stream state for one workload kind
#[derive(Debug)]
pub struct WorkloadWatchState {
    index: Arc<ResourceIndex>,
    kind: WorkloadKind,
    scope: WatchScope,
    synced: bool,
    listing: Option<HashSet<WorkloadId>>,
}

impl WorkloadWatchState {
    #[must_use]
    pub fn new(index: Arc<ResourceIndex>, kind: WorkloadKind, scope: WatchScope) -> Self {
        Self {
            index,
            kind,
            scope,
            synced: false,
            listing: None,
        }
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn handle(&mut self, event: Event<ObservedWorkload>) -> Vec<WorkloadSignal> {
        match event {
            Event::Init => {
                self.listing = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(observed) | Event::Apply(observed) => {
                if !self.scope.admits(&observed.id.namespace) {
                    return Vec::new();
                }
                if let Some(listing) = self.listing.as_mut() {
                    listing.insert(observed.id.clone());
                }
                let id = observed.id.clone();
                let update = self.index.upsert_workload(observed);
                vec![WorkloadSignal::Applied(id, update)]
            }
            Event::InitDone => {
                let seen = self.listing.take().unwrap_or_default();
                let vanished: Vec<WorkloadId> = self
                    .index
                    .workload_ids(self.kind, self.scope.namespace.as_deref())
                    .into_iter()
                    .filter(|id| self.scope.admits(&id.namespace) && !seen.contains(id))
                    .collect();
                info!(
                    kind = %self.kind,
                    scope = self.scope.label(),
                    listed = seen.len(),
                    "Workload listing completed"
                );
                self.synced = true;
                vanished
                    .into_iter()
                    .filter(|id| self.index.remove_workload(id).is_some())
                    .map(WorkloadSignal::Deleted)
                    .collect()
            }
            Event::Delete(observed) => {
                if !self.scope.admits(&observed.id.namespace) {
                    return Vec::new();
                }
                match self.index.remove_workload(&observed.id) {
                    Some(_) => vec![WorkloadSignal::Deleted(observed.id)],
                    None => Vec::new(),
                }
            }
        }
    }
}
