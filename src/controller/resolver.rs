//! # Dependency Resolver
//!
//! Maps a changed ConfigMap/Secret to the workloads that depend on it.
//!
//! A workload depends on a resource when:
//! - it names the resource in `<kind>.reloader.<domain>/reload` (any enabled mode), or
//! - its pod template references the resource and the policy is auto mode for that
//!   kind, or search-match mode with the resource carrying `reloader.<domain>/match: "true"`, or
//! - it is in search-match mode and its labels satisfy every
//!   `match.reloader.<domain>/<label>` selector on the resource (same namespace).
//!
//! Workloads that reference the resource but are disabled or misconfigured are
//! still returned so the policy engine can account for them.

use crate::controller::index::ResourceIndex;
use crate::controller::policy::{annotation_enabled, PolicyError, ReloadMode, ReloadPolicy};
use crate::resources::identity::WorkloadId;
use crate::resources::watched::WatchedResource;
use crate::resources::workload::WorkloadRef;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A workload that must be considered for one resource change
#[derive(Debug, Clone)]
pub struct Candidate {
    pub workload: WorkloadId,
    pub policy: Result<Arc<ReloadPolicy>, PolicyError>,
}

/// Resolve dependents of `resource` from the shared index
#[must_use]
pub fn resolve(index: &ResourceIndex, resource: &WatchedResource) -> Vec<Candidate> {
    let defaults = index.defaults();
    let opted_in = annotation_enabled(&resource.annotations, &defaults.keys.match_);
    let selectors: Vec<(&str, &str)> = defaults.keys.match_selectors(&resource.annotations).collect();

    let mut candidates: BTreeMap<WorkloadId, Candidate> = BTreeMap::new();

    for workload in index.referencing(&resource.id) {
        let policy = workload.policy(defaults);
        // Disabled and misconfigured workloads are surfaced so the engine can skip and report them.
        let surfaced = !matches!(&policy, Ok(p) if p.mode != ReloadMode::Disabled);
        if surfaced || workload.depends_on(&resource.id, opted_in, defaults) {
            candidates.insert(workload.id.clone(), candidate(workload, policy));
        }
    }

    if !selectors.is_empty() {
        for workload in index.in_namespace(&resource.id.namespace) {
            let policy = workload.policy(defaults);
            let search_mode = matches!(&policy, Ok(p) if p.mode == ReloadMode::SearchMatch);
            if search_mode && workload.matches_labels(selectors.iter().copied()) {
                candidates
                    .entry(workload.id.clone())
                    .or_insert_with(|| candidate(workload, policy));
            }
        }
    }

    candidates.into_values().collect()
}

fn candidate(workload: WorkloadRef, policy: Result<Arc<ReloadPolicy>, PolicyError>) -> Candidate {
    Candidate {
        workload: workload.id,
        policy,
    }
}
