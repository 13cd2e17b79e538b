//! # Reload Policy
//!
//! Strongly typed view of a workload's reload annotations.
//!
//! The annotation schema is parsed once per annotation set into a
//! [`ReloadPolicy`]. Invalid values surface as [`PolicyError`]s; a workload whose
//! policy fails to parse is treated as disabled until its annotations change.

pub mod annotations;
pub mod duration;

pub use annotations::{AnnotationKeys, RESTARTED_AT_ANNOTATION};
pub use duration::{parse_duration, DurationError};

use crate::resources::identity::{ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How a workload's dependencies are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadMode {
    /// Never reload
    Disabled,
    /// Every ConfigMap/Secret referenced by the pod template (optionally one kind only)
    Auto,
    /// Only resources named in `<kind>.reloader.<domain>/reload`
    Named,
    /// Referenced resources that opt in with `reloader.<domain>/match`, plus selector fan-out
    SearchMatch,
}

impl ReloadMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadMode::Disabled => "disabled",
            ReloadMode::Auto => "auto",
            ReloadMode::Named => "named",
            ReloadMode::SearchMatch => "search-match",
        }
    }
}

/// How the rollout trigger updates a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStrategy {
    /// `kubectl rollout restart` equivalent (`restartedAt` template annotation)
    RolloutRestart,
    /// Write the triggering fingerprint onto the pod template
    PatchAnnotation,
}

impl RolloutStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStrategy::RolloutRestart => "restart",
            RolloutStrategy::PatchAnnotation => "annotation",
        }
    }
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutStrategy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "restart" | "rollout-restart" => Ok(RolloutStrategy::RolloutRestart),
            "annotation" | "annotations" | "patch-annotation" => {
                Ok(RolloutStrategy::PatchAnnotation)
            }
            other => Err(PolicyError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Structured annotation misconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("annotation '{key}' must be \"true\" or \"false\", got '{value}'")]
    InvalidBoolean { key: String, value: String },
    #[error("invalid pause period '{value}': {source}")]
    InvalidPausePeriod {
        value: String,
        #[source]
        source: DurationError,
    },
    #[error("unknown rollout strategy '{0}', expected \"restart\" or \"annotation\"")]
    InvalidStrategy(String),
    #[error("auto and search annotations cannot both be enabled")]
    ConflictingModes,
    #[error("{0} is both named for reload and excluded")]
    NamedAndExcluded(ResourceId),
}

/// Controller-wide inputs to policy resolution
#[derive(Debug, Clone)]
pub struct PolicyDefaults {
    pub keys: AnnotationKeys,
    /// Workloads without reload annotations default to auto mode
    pub auto_reload_all: bool,
    pub strategy: RolloutStrategy,
}

/// Resolved reload configuration of one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadPolicy {
    pub mode: ReloadMode,
    /// Kinds whose implicit references count in auto mode
    pub auto_kinds: BTreeSet<ResourceKind>,
    pub named: BTreeSet<ResourceId>,
    pub ignored_resources: BTreeSet<ResourceId>,
    pub pause_window: Option<Duration>,
    pub strategy: RolloutStrategy,
}

impl ReloadPolicy {
    /// A policy that never reloads
    #[must_use]
    pub fn disabled(strategy: RolloutStrategy) -> Self {
        Self {
            mode: ReloadMode::Disabled,
            auto_kinds: BTreeSet::new(),
            named: BTreeSet::new(),
            ignored_resources: BTreeSet::new(),
            pause_window: None,
            strategy,
        }
    }

    /// Parse a workload's annotations
    pub fn from_annotations(
        namespace: &str,
        annotations: &BTreeMap<String, String>,
        defaults: &PolicyDefaults,
    ) -> Result<Self, PolicyError> {
        let keys = &defaults.keys;

        let auto = parse_bool(annotations, &keys.auto)?;
        let configmap_auto = parse_bool(annotations, &keys.configmap_auto)?.unwrap_or(false);
        let secret_auto = parse_bool(annotations, &keys.secret_auto)?.unwrap_or(false);
        let search = parse_bool(annotations, &keys.search)?.unwrap_or(false);

        if auto == Some(true) && search {
            return Err(PolicyError::ConflictingModes);
        }

        let named = named_references(namespace, annotations, keys);
        let ignored_resources = excluded_references(namespace, annotations, keys);
        if let Some(conflict) = named.intersection(&ignored_resources).next() {
            return Err(PolicyError::NamedAndExcluded(conflict.clone()));
        }

        let pause_window = annotations
            .get(&keys.pause_period)
            .map(|value| {
                parse_duration(value).map_err(|source| PolicyError::InvalidPausePeriod {
                    value: value.clone(),
                    source,
                })
            })
            .transpose()?;

        let strategy = annotations
            .get(&keys.rollout_strategy)
            .map(|value| value.parse::<RolloutStrategy>())
            .transpose()?
            .unwrap_or(defaults.strategy);

        let all_kinds: BTreeSet<ResourceKind> = [ResourceKind::ConfigMap, ResourceKind::Secret]
            .into_iter()
            .collect();
        let (mode, auto_kinds) = if auto == Some(true) {
            (ReloadMode::Auto, all_kinds)
        } else if configmap_auto || secret_auto {
            let mut kinds = BTreeSet::new();
            if configmap_auto {
                kinds.insert(ResourceKind::ConfigMap);
            }
            if secret_auto {
                kinds.insert(ResourceKind::Secret);
            }
            (ReloadMode::Auto, kinds)
        } else if search {
            (ReloadMode::SearchMatch, BTreeSet::new())
        } else if !named.is_empty() {
            (ReloadMode::Named, BTreeSet::new())
        } else if defaults.auto_reload_all && auto != Some(false) {
            (ReloadMode::Auto, all_kinds)
        } else {
            (ReloadMode::Disabled, BTreeSet::new())
        };

        Ok(Self {
            mode,
            auto_kinds,
            named,
            ignored_resources,
            pause_window,
            strategy,
        })
    }

    /// Whether an implicit (pod template) reference to `kind` counts under this policy
    #[must_use]
    pub fn honours_implicit(&self, kind: ResourceKind) -> bool {
        self.mode == ReloadMode::Auto && self.auto_kinds.contains(&kind)
    }
}

/// Resources named by `configmap.reloader.<domain>/reload` and `secret.reloader.<domain>/reload`
///
/// Infallible so a misconfigured workload still indexes its explicit references.
#[must_use]
pub fn named_references(
    namespace: &str,
    annotations: &BTreeMap<String, String>,
    keys: &AnnotationKeys,
) -> BTreeSet<ResourceId> {
    let mut refs = BTreeSet::new();
    collect_names(
        &mut refs,
        namespace,
        annotations.get(&keys.configmap_reload),
        ResourceKind::ConfigMap,
    );
    collect_names(
        &mut refs,
        namespace,
        annotations.get(&keys.secret_reload),
        ResourceKind::Secret,
    );
    refs
}

fn excluded_references(
    namespace: &str,
    annotations: &BTreeMap<String, String>,
    keys: &AnnotationKeys,
) -> BTreeSet<ResourceId> {
    let mut refs = BTreeSet::new();
    collect_names(
        &mut refs,
        namespace,
        annotations.get(&keys.configmap_exclude),
        ResourceKind::ConfigMap,
    );
    collect_names(
        &mut refs,
        namespace,
        annotations.get(&keys.secret_exclude),
        ResourceKind::Secret,
    );
    refs
}

fn collect_names(
    into: &mut BTreeSet<ResourceId>,
    namespace: &str,
    value: Option<&String>,
    kind: ResourceKind,
) {
    let Some(value) = value else { return };
    into.extend(
        value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| ResourceId::new(kind, namespace, name)),
    );
}

fn parse_bool(
    annotations: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<bool>, PolicyError> {
    match annotations.get(key) {
        None => Ok(None),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(PolicyError::InvalidBoolean {
                key: key.to_string(),
                value: value.clone(),
            }),
        },
    }
}

/// Whether a boolean annotation is set to `"true"`; malformed values read as false
#[must_use]
pub fn annotation_enabled(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    matches!(parse_bool(annotations, key), Ok(Some(true)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> PolicyDefaults {
        PolicyDefaults {
            keys: AnnotationKeys::new("stakater.com"),
            auto_reload_all: false,
            strategy: RolloutStrategy::RolloutRestart,
        }
    }

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    mod mode_tests {
        use super::*;

        #[test]
        fn test_no_annotations_is_disabled() {
            let policy = ReloadPolicy::from_annotations("ns1", &BTreeMap::new(), &defaults())
                .unwrap();
            assert_eq!(policy.mode, ReloadMode::Disabled);
        }

        #[test]
        fn test_auto_mode() {
            let policy = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[("reloader.stakater.com/auto", "true")]),
                &defaults(),
            )
            .unwrap();
            assert_eq!(policy.mode, ReloadMode::Auto);
            assert!(policy.honours_implicit(ResourceKind::ConfigMap));
            assert!(policy.honours_implicit(ResourceKind::Secret));
        }

        #[test]
        fn test_typed_auto_limits_kinds() {
            let policy = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[("secret.reloader.stakater.com/auto", "true")]),
                &defaults(),
            )
            .unwrap();
            assert_eq!(policy.mode, ReloadMode::Auto);
            assert!(policy.honours_implicit(ResourceKind::Secret));
            assert!(!policy.honours_implicit(ResourceKind::ConfigMap));
        }

        #[test]
        fn test_named_mode_with_comma_list() {
            let policy = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[("configmap.reloader.stakater.com/reload", "a, b,,c")]),
                &defaults(),
            )
            .unwrap();
            assert_eq!(policy.mode, ReloadMode::Named);
            assert_eq!(policy.named.len(), 3);
            assert!(policy.named.contains(&ResourceId::config_map("ns1", "b")));
            assert!(!policy.honours_implicit(ResourceKind::ConfigMap));
        }

        #[test]
        fn test_search_mode() {
            let policy = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[("reloader.stakater.com/search", "true")]),
                &defaults(),
            )
            .unwrap();
            assert_eq!(policy.mode, ReloadMode::SearchMatch);
        }

        #[test]
        fn test_auto_reload_all_default_and_opt_out() {
            let mut defaults = defaults();
            defaults.auto_reload_all = true;

            let policy = ReloadPolicy::from_annotations("ns1", &BTreeMap::new(), &defaults)
                .unwrap();
            assert_eq!(policy.mode, ReloadMode::Auto);

            let opted_out = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[("reloader.stakater.com/auto", "false")]),
                &defaults,
            )
            .unwrap();
            assert_eq!(opted_out.mode, ReloadMode::Disabled);
        }
    }

    mod misconfiguration_tests {
        use super::*;

        #[test]
        fn test_invalid_pause_period() {
            let err = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[
                    ("reloader.stakater.com/auto", "true"),
                    ("reloader.stakater.com/pause-period", "soon"),
                ]),
                &defaults(),
            )
            .unwrap_err();
            assert!(matches!(err, PolicyError::InvalidPausePeriod { .. }));
        }

        #[test]
        fn test_invalid_strategy() {
            let err = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[
                    ("reloader.stakater.com/auto", "true"),
                    ("reloader.stakater.com/rollout-strategy", "recreate"),
                ]),
                &defaults(),
            )
            .unwrap_err();
            assert_eq!(err, PolicyError::InvalidStrategy("recreate".to_string()));
        }

        #[test]
        fn test_invalid_boolean() {
            let err = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[("reloader.stakater.com/auto", "yes please")]),
                &defaults(),
            )
            .unwrap_err();
            assert!(matches!(err, PolicyError::InvalidBoolean { .. }));
        }

        #[test]
        fn test_auto_and_search_conflict() {
            let err = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[
                    ("reloader.stakater.com/auto", "true"),
                    ("reloader.stakater.com/search", "true"),
                ]),
                &defaults(),
            )
            .unwrap_err();
            assert_eq!(err, PolicyError::ConflictingModes);
        }

        #[test]
        fn test_named_and_excluded_conflict() {
            let err = ReloadPolicy::from_annotations(
                "ns1",
                &annotations(&[
                    ("secret.reloader.stakater.com/reload", "db-creds"),
                    ("secrets.exclude.reloader.stakater.com/reload", "db-creds"),
                ]),
                &defaults(),
            )
            .unwrap_err();
            assert_eq!(
                err,
                PolicyError::NamedAndExcluded(ResourceId::secret("ns1", "db-creds"))
            );
        }
    }

    #[test]
    fn test_pause_and_strategy_parsed() {
        let policy = ReloadPolicy::from_annotations(
            "ns1",
            &annotations(&[
                ("reloader.stakater.com/auto", "true"),
                ("reloader.stakater.com/pause-period", "5m"),
                ("reloader.stakater.com/rollout-strategy", "annotation"),
                ("configmaps.exclude.reloader.stakater.com/reload", "feature-flags"),
            ]),
            &defaults(),
        )
        .unwrap();
        assert_eq!(policy.pause_window, Some(Duration::from_secs(300)));
        assert_eq!(policy.strategy, RolloutStrategy::PatchAnnotation);
        assert!(policy
            .ignored_resources
            .contains(&ResourceId::config_map("ns1", "feature-flags")));
    }
}
