//! # Annotation Keys
//!
//! The annotation vocabulary read from workloads and resources, and written to
//! pod templates. Every key hangs off a configurable domain
//! (`reloader.<domain>/auto`, `configmap.reloader.<domain>/reload`, ...).

use crate::resources::identity::ResourceId;
use sha2::{Digest, Sha256};

/// Annotation written by `kubectl rollout restart`
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Maximum length of the name segment of an annotation key
const MAX_NAME_SEGMENT: usize = 63;

/// Fully qualified annotation keys for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationKeys {
    domain: String,
    pub auto: String,
    pub configmap_auto: String,
    pub secret_auto: String,
    pub configmap_reload: String,
    pub secret_reload: String,
    pub configmap_exclude: String,
    pub secret_exclude: String,
    pub search: String,
    pub match_: String,
    pub ignore: String,
    pub pause_period: String,
    pub rollout_strategy: String,
    /// Prefix of selector annotations on resources: `match.reloader.<domain>/<label>`
    pub match_selector_prefix: String,
}

impl AnnotationKeys {
    #[must_use]
    pub fn new(domain: &str) -> Self {
        let domain = domain.trim().trim_matches('.').to_string();
        Self {
            auto: format!("reloader.{domain}/auto"),
            configmap_auto: format!("configmap.reloader.{domain}/auto"),
            secret_auto: format!("secret.reloader.{domain}/auto"),
            configmap_reload: format!("configmap.reloader.{domain}/reload"),
            secret_reload: format!("secret.reloader.{domain}/reload"),
            configmap_exclude: format!("configmaps.exclude.reloader.{domain}/reload"),
            secret_exclude: format!("secrets.exclude.reloader.{domain}/reload"),
            search: format!("reloader.{domain}/search"),
            match_: format!("reloader.{domain}/match"),
            ignore: format!("reloader.{domain}/ignore"),
            pause_period: format!("reloader.{domain}/pause-period"),
            rollout_strategy: format!("reloader.{domain}/rollout-strategy"),
            match_selector_prefix: format!("match.reloader.{domain}/"),
            domain,
        }
    }

    /// Pod template annotation recording the fingerprint a workload was last rolled for
    ///
    /// `<kind>.reloader.<domain>/<name>`; names longer than an annotation name
    /// segment allows are shortened to a prefix plus a stable hash suffix.
    #[must_use]
    pub fn template_hash_key(&self, resource: &ResourceId) -> String {
        format!(
            "{}.reloader.{}/{}",
            resource.kind.as_str(),
            self.domain,
            name_segment(&resource.name)
        )
    }

    /// Label selector pairs declared on a resource via `match.reloader.<domain>/<label>`
    pub fn match_selectors<'a>(
        &'a self,
        annotations: &'a std::collections::BTreeMap<String, String>,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        annotations.iter().filter_map(move |(key, value)| {
            key.strip_prefix(self.match_selector_prefix.as_str())
                .filter(|label| !label.is_empty())
                .map(|label| (label, value.as_str()))
        })
    }
}

fn name_segment(name: &str) -> String {
    if name.len() <= MAX_NAME_SEGMENT {
        return name.to_string();
    }
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    // Resource names are DNS subdomains (ASCII), so byte slicing is safe.
    let keep = MAX_NAME_SEGMENT - 9;
    format!("{}-{}", name[..keep].trim_end_matches(['.', '-']), &digest[..8])
}
