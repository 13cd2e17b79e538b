//! # Watched Resources
//!
//! In-memory view of a ConfigMap or Secret: identity, content fingerprints and
//! the annotations the policy engine consults (`ignore`, `match`).

use crate::controller::fingerprint::{fingerprint_config_map, fingerprint_secret, Fingerprint};
use crate::resources::identity::{ResourceId, ResourceKind};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::collections::BTreeMap;

/// Snapshot of a ConfigMap or Secret as observed by the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResource {
    pub id: ResourceId,
    pub fingerprint: Fingerprint,
    pub annotations: BTreeMap<String, String>,
}

impl ObservedResource {
    /// Returns `None` for objects without a name or namespace
    #[must_use]
    pub fn from_config_map(config_map: &ConfigMap) -> Option<Self> {
        let name = config_map.metadata.name.as_deref()?;
        let namespace = config_map.metadata.namespace.as_deref()?;
        Some(Self {
            id: ResourceId::new(ResourceKind::ConfigMap, namespace, name),
            fingerprint: fingerprint_config_map(config_map),
            annotations: config_map.metadata.annotations.clone().unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let name = secret.metadata.name.as_deref()?;
        let namespace = secret.metadata.namespace.as_deref()?;
        Some(Self {
            id: ResourceId::new(ResourceKind::Secret, namespace, name),
            fingerprint: fingerprint_secret(secret),
            annotations: secret.metadata.annotations.clone().unwrap_or_default(),
        })
    }
}

/// Tracked state of one ConfigMap or Secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedResource {
    pub id: ResourceId,
    /// Fingerprint of the most recently observed payload
    pub content_fingerprint: Fingerprint,
    /// Fingerprint at the previous reconciliation; `None` until a second observation
    pub last_seen_fingerprint: Option<Fingerprint>,
    pub annotations: BTreeMap<String, String>,
}

impl WatchedResource {
    #[must_use]
    pub fn new(observed: ObservedResource) -> Self {
        Self {
            id: observed.id,
            content_fingerprint: observed.fingerprint,
            last_seen_fingerprint: None,
            annotations: observed.annotations,
        }
    }

    /// Annotation value, if present
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Notification that a resource's content changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChanged {
    pub id: ResourceId,
    /// `None` when the resource was first seen on the live stream
    pub old_fingerprint: Option<Fingerprint>,
    pub new_fingerprint: Fingerprint,
}
