//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::controller::policy::{AnnotationKeys, PolicyDefaults, RolloutStrategy};
use crate::controller::trigger::RolloutSettings;
use crate::controller::watcher::WatchScope;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespaces to watch; empty watches the whole cluster
    pub watch_namespaces: Vec<String>,
    /// Namespaces never watched, even in cluster-wide mode
    pub ignored_namespaces: BTreeSet<String>,
    /// Label selector applied to ConfigMap and Secret watches
    pub resource_label_selector: Option<String>,
    /// Domain of the reload annotations
    pub annotation_domain: String,
    /// Workloads without reload annotations behave as `auto`
    pub auto_reload_all: bool,
    /// Resources created after startup trigger their dependents
    pub reload_on_create: bool,
    /// `restart` or `annotation`
    pub default_rollout_strategy: String,
    /// Rollout worker count
    pub max_concurrent_rollouts: usize,
    pub rollout_queue_capacity: usize,
    /// Attempts per rollout, first attempt included
    pub rollout_max_attempts: u32,
    pub rollout_attempt_timeout_secs: u64,
    /// Exponential backoff starting value (milliseconds)
    /// Initial delay before retrying after an error
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    /// Maximum delay between retries
    pub backoff_max_ms: u64,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Chat webhook receiving notification summaries
    pub webhook_url: Option<String>,
    pub notification_timeout_secs: u64,
    pub audit_log_capacity: usize,
    /// Field manager recorded on workload patches
    pub field_manager: String,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE), used when `RUST_LOG` is unset
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            watch_namespaces: Vec::new(),
            ignored_namespaces: BTreeSet::new(),
            resource_label_selector: None,
            annotation_domain: DEFAULT_ANNOTATION_DOMAIN.to_string(),
            auto_reload_all: false,
            reload_on_create: false,
            default_rollout_strategy: DEFAULT_ROLLOUT_STRATEGY.to_string(),
            max_concurrent_rollouts: DEFAULT_MAX_CONCURRENT_ROLLOUTS,
            rollout_queue_capacity: DEFAULT_ROLLOUT_QUEUE_CAPACITY,
            rollout_max_attempts: DEFAULT_ROLLOUT_MAX_ATTEMPTS,
            rollout_attempt_timeout_secs: DEFAULT_ROLLOUT_ATTEMPT_TIMEOUT_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            webhook_url: None,
            notification_timeout_secs: DEFAULT_NOTIFICATION_TIMEOUT_SECS,
            audit_log_capacity: DEFAULT_AUDIT_LOG_CAPACITY,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            watch_namespaces: parse_list(&env_var_or_default_str("WATCH_NAMESPACES", "")),
            ignored_namespaces: parse_list(&env_var_or_default_str("IGNORED_NAMESPACES", ""))
                .into_iter()
                .collect(),
            resource_label_selector: env_var_optional("RESOURCE_LABEL_SELECTOR"),
            annotation_domain: env_var_or_default_str(
                "ANNOTATION_DOMAIN",
                DEFAULT_ANNOTATION_DOMAIN,
            ),
            auto_reload_all: env_var_or_default_bool("AUTO_RELOAD_ALL", false),
            reload_on_create: env_var_or_default_bool("RELOAD_ON_CREATE", false),
            default_rollout_strategy: env_var_or_default_str(
                "DEFAULT_ROLLOUT_STRATEGY",
                DEFAULT_ROLLOUT_STRATEGY,
            ),
            max_concurrent_rollouts: env_var_or_default(
                "MAX_CONCURRENT_ROLLOUTS",
                DEFAULT_MAX_CONCURRENT_ROLLOUTS,
            ),
            rollout_queue_capacity: env_var_or_default(
                "ROLLOUT_QUEUE_CAPACITY",
                DEFAULT_ROLLOUT_QUEUE_CAPACITY,
            ),
            rollout_max_attempts: env_var_or_default(
                "ROLLOUT_MAX_ATTEMPTS",
                DEFAULT_ROLLOUT_MAX_ATTEMPTS,
            ),
            rollout_attempt_timeout_secs: env_var_or_default(
                "ROLLOUT_ATTEMPT_TIMEOUT_SECS",
                DEFAULT_ROLLOUT_ATTEMPT_TIMEOUT_SECS,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            webhook_url: env_var_optional("WEBHOOK_URL"),
            notification_timeout_secs: env_var_or_default(
                "NOTIFICATION_TIMEOUT_SECS",
                DEFAULT_NOTIFICATION_TIMEOUT_SECS,
            ),
            audit_log_capacity: env_var_or_default(
                "AUDIT_LOG_CAPACITY",
                DEFAULT_AUDIT_LOG_CAPACITY,
            ),
            field_manager: env_var_or_default_str("FIELD_MANAGER", DEFAULT_FIELD_MANAGER),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Annotation keys and controller-wide policy defaults
    pub fn policy_defaults(&self) -> Result<PolicyDefaults> {
        let strategy = self
            .default_rollout_strategy
            .parse::<RolloutStrategy>()
            .context("Invalid DEFAULT_ROLLOUT_STRATEGY")?;
        Ok(PolicyDefaults {
            keys: AnnotationKeys::new(&self.annotation_domain),
            auto_reload_all: self.auto_reload_all,
            strategy,
        })
    }

    /// One scope per watched namespace, or a single cluster-wide scope
    pub fn watch_scopes(&self) -> Vec<WatchScope> {
        if self.watch_namespaces.is_empty() {
            return vec![WatchScope::all(self.ignored_namespaces.clone())];
        }
        self.watch_namespaces
            .iter()
            .filter(|namespace| !self.ignored_namespaces.contains(*namespace))
            .map(|namespace| WatchScope {
                namespace: Some(namespace.clone()),
                ignored_namespaces: self.ignored_namespaces.clone(),
            })
            .collect()
    }

    pub fn rollout_settings(&self) -> RolloutSettings {
        RolloutSettings {
            max_attempts: self.rollout_max_attempts.max(1),
            attempt_timeout: self.rollout_attempt_timeout(),
            backoff_start_ms: self.backoff_start_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    /// Get rollout attempt deadline
    pub fn rollout_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_attempt_timeout_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Get notification delivery deadline
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }
}

/// Split a comma-separated list, dropping blanks
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a non-empty environment variable
fn env_var_optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
