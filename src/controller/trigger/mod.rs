//! # Rollout Trigger
//!
//! Performs the rollout of one workload for one resource change, with
//! bounded retries.
//!
//! ## Strategies
//!
//! - `restart`: sets `kubectl.kubernetes.io/restartedAt` on the pod template,
//!   exactly as `kubectl rollout restart` does. The workload's own update
//!   strategy and disruption budgets govern the actual pod replacement.
//! - `annotation`: writes `<kind>.reloader.<domain>/<name>: <fingerprint>` on
//!   the pod template. Idempotent: nothing is patched when the annotation is
//!   already current.
//!
//! ## Retry classification
//!
//! Conflicts, throttling, server errors, transport errors and attempt timeouts
//! are retried with exponential backoff and a fresh read. A vanished workload
//! is `skipped`. Forbidden, invalid and quota rejections fail immediately.

pub mod api;
pub mod dispatcher;

pub use api::{KubeWorkloadApi, WorkloadApi, WorkloadSnapshot};
pub use dispatcher::{Dispatcher, RolloutQueue};

use crate::controller::backoff::ExponentialBackoff;
use crate::controller::fingerprint::Fingerprint;
use crate::controller::policy::{AnnotationKeys, RolloutStrategy, RESTARTED_AT_ANNOTATION};
use crate::observability::metrics;
use crate::resources::event::{ReloadEvent, ReloadOutcome};
use crate::resources::identity::{ResourceId, WorkloadId};
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

/// One unit of work for the rollout workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutJob {
    pub workload: WorkloadId,
    pub resource: ResourceId,
    pub old_fingerprint: Option<Fingerprint>,
    pub new_fingerprint: Fingerprint,
    pub strategy: RolloutStrategy,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("workload not found")]
    NotFound,
    #[error("rejected by the API server ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("transient API error: {0}")]
    Transient(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl TriggerError {
    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriggerError::Conflict(_) | TriggerError::Transient(_) | TriggerError::Timeout(_)
        )
    }
}

impl From<kube::Error> for TriggerError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => match response.code {
                404 => TriggerError::NotFound,
                409 => TriggerError::Conflict(response.message),
                429 | 500..=599 => TriggerError::Transient(format!(
                    "{} ({})",
                    response.message, response.code
                )),
                code => TriggerError::Rejected {
                    code,
                    message: response.message,
                },
            },
            kube::Error::SerdeError(e) => TriggerError::Rejected {
                code: 0,
                message: e.to_string(),
            },
            other => TriggerError::Transient(other.to_string()),
        }
    }
}

/// Retry budget and deadlines for rollouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_start_ms: u64,
    pub backoff_max_ms: u64,
}

enum AttemptOutcome {
    Patched,
    AlreadyCurrent,
}

/// Executes [`RolloutJob`]s against a [`WorkloadApi`]
pub struct RolloutTrigger {
    api: Arc<dyn WorkloadApi>,
    keys: AnnotationKeys,
    settings: RolloutSettings,
}

impl std::fmt::Debug for RolloutTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutTrigger")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RolloutTrigger {
    #[must_use]
    pub fn new(api: Arc<dyn WorkloadApi>, keys: AnnotationKeys, settings: RolloutSettings) -> Self {
        Self {
            api,
            keys,
            settings,
        }
    }

    /// Roll the workload out, retrying retryable failures, and describe the result
    pub async fn execute(&self, job: &RolloutJob) -> ReloadEvent {
        let span = tracing::span!(
            tracing::Level::INFO,
            "controller.rollout",
            workload.kind = job.workload.kind.as_str(),
            workload.namespace = job.workload.namespace.as_str(),
            workload.name = job.workload.name.as_str(),
            resource.kind = job.resource.kind.as_str(),
            resource.name = job.resource.name.as_str(),
            strategy = job.strategy.as_str()
        );
        self.run_attempts(job).instrument(span).await
    }

    async fn run_attempts(&self, job: &RolloutJob) -> ReloadEvent {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut backoff =
            ExponentialBackoff::new(self.settings.backoff_start_ms, self.settings.backoff_max_ms);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let started = Instant::now();
            let result =
                match tokio::time::timeout(self.settings.attempt_timeout, self.attempt(job)).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(TriggerError::Timeout(self.settings.attempt_timeout)),
                };
            metrics::observe_rollout_attempt_duration(started.elapsed().as_secs_f64());

            let (outcome, detail) = match result {
                Ok(AttemptOutcome::Patched) => {
                    info!(
                        attempts,
                        fingerprint = job.new_fingerprint.short(),
                        "Rollout triggered for {}",
                        job.workload
                    );
                    (ReloadOutcome::Succeeded, None)
                }
                Ok(AttemptOutcome::AlreadyCurrent) => {
                    debug!("Pod template already carries fingerprint, nothing to patch");
                    (
                        ReloadOutcome::Skipped,
                        Some("pod template already current".to_string()),
                    )
                }
                Err(TriggerError::NotFound) => {
                    info!("Workload {} no longer exists, skipping rollout", job.workload);
                    (ReloadOutcome::Skipped, Some("workload not found".to_string()))
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let delay = backoff.next_backoff();
                    warn!(
                        attempts,
                        error = %e,
                        "Rollout attempt failed, retrying in {}ms",
                        delay.as_millis()
                    );
                    metrics::increment_rollout_retries();
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempts, error = %e, "Rollout retry budget exhausted");
                    (
                        ReloadOutcome::Failed,
                        Some(format!("retry budget exhausted: {e}")),
                    )
                }
                Err(e) => {
                    warn!(attempts, error = %e, "Rollout rejected");
                    (ReloadOutcome::Failed, Some(e.to_string()))
                }
            };

            return ReloadEvent::new(
                job.workload.clone(),
                job.resource.clone(),
                job.old_fingerprint.clone(),
                Some(job.new_fingerprint.clone()),
                outcome,
                attempts,
                detail,
            );
        }
    }

    async fn attempt(&self, job: &RolloutJob) -> Result<AttemptOutcome, TriggerError> {
        let snapshot = self
            .api
            .get(&job.workload)
            .await?
            .ok_or(TriggerError::NotFound)?;

        let mut annotations = BTreeMap::new();
        match job.strategy {
            RolloutStrategy::PatchAnnotation => {
                let key = self.keys.template_hash_key(&job.resource);
                if snapshot.template_annotations.get(&key).map(String::as_str)
                    == Some(job.new_fingerprint.as_str())
                {
                    return Ok(AttemptOutcome::AlreadyCurrent);
                }
                annotations.insert(key, job.new_fingerprint.to_string());
            }
            RolloutStrategy::RolloutRestart => {
                annotations.insert(
                    RESTARTED_AT_ANNOTATION.to_string(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                );
            }
        }

        self.api
            .patch_template_annotations(
                &job.workload,
                &annotations,
                snapshot.resource_version.as_deref(),
            )
            .await?;
        Ok(AttemptOutcome::Patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fingerprint::ResourceContent;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted API: pops one result per call, then falls back to success
    #[derive(Default)]
    struct ScriptedApi {
        annotations: Mutex<BTreeMap<String, String>>,
        get_failures: Mutex<VecDeque<TriggerError>>,
        patch_failures: Mutex<VecDeque<TriggerError>>,
        patches: Mutex<Vec<BTreeMap<String, String>>>,
        missing: bool,
        hang: bool,
    }

    #[async_trait]
    impl WorkloadApi for ScriptedApi {
        async fn get(&self, _id: &WorkloadId) -> Result<Option<WorkloadSnapshot>, TriggerError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(e) = self.get_failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            if self.missing {
                return Ok(None);
            }
            Ok(Some(WorkloadSnapshot {
                resource_version: Some("1".to_string()),
                template_annotations: self.annotations.lock().unwrap().clone(),
            }))
        }

        async fn patch_template_annotations(
            &self,
            _id: &WorkloadId,
            annotations: &BTreeMap<String, String>,
            _resource_version: Option<&str>,
        ) -> Result<(), TriggerError> {
            if let Some(e) = self.patch_failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            self.annotations
                .lock()
                .unwrap()
                .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.patches.lock().unwrap().push(annotations.clone());
            Ok(())
        }
    }

    fn settings() -> RolloutSettings {
        RolloutSettings {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff_start_ms: 100,
            backoff_max_ms: 1_000,
        }
    }

    fn job(strategy: RolloutStrategy) -> RolloutJob {
        let mut content = ResourceContent::new();
        content.insert_text("LOG_LEVEL", b"debug");
        RolloutJob {
            workload: WorkloadId::deployment("ns1", "api"),
            resource: ResourceId::config_map("ns1", "app-config"),
            old_fingerprint: None,
            new_fingerprint: content.fingerprint(),
            strategy,
        }
    }

    fn trigger(api: Arc<ScriptedApi>) -> RolloutTrigger {
        RolloutTrigger::new(api, AnnotationKeys::new("stakater.com"), settings())
    }

    mod strategy_tests {
        use super::*;

        #[tokio::test]
        async fn test_restart_sets_restarted_at() {
            let api = Arc::new(ScriptedApi::default());
            let event = trigger(Arc::clone(&api))
                .execute(&job(RolloutStrategy::RolloutRestart))
                .await;
            assert_eq!(event.outcome, ReloadOutcome::Succeeded);
            assert_eq!(event.attempts, 1);
            let patches = api.patches.lock().unwrap();
            assert!(patches[0].contains_key(RESTARTED_AT_ANNOTATION));
        }

        #[tokio::test]
        async fn test_patch_annotation_is_idempotent() {
            let api = Arc::new(ScriptedApi::default());
            let trigger = trigger(Arc::clone(&api));
            let job = job(RolloutStrategy::PatchAnnotation);

            let first = trigger.execute(&job).await;
            let second = trigger.execute(&job).await;

            assert_eq!(first.outcome, ReloadOutcome::Succeeded);
            assert_eq!(second.outcome, ReloadOutcome::Skipped);
            assert_eq!(api.patches.lock().unwrap().len(), 1);
            let annotations = api.annotations.lock().unwrap();
            assert_eq!(
                annotations
                    .get("configmap.reloader.stakater.com/app-config")
                    .map(String::as_str),
                Some(job.new_fingerprint.as_str())
            );
        }
    }

    mod retry_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_conflict_is_retried_with_fresh_read() {
            let api = Arc::new(ScriptedApi::default());
            api.patch_failures
                .lock()
                .unwrap()
                .push_back(TriggerError::Conflict("stale resourceVersion".to_string()));
            let event = trigger(Arc::clone(&api))
                .execute(&job(RolloutStrategy::RolloutRestart))
                .await;
            assert_eq!(event.outcome, ReloadOutcome::Succeeded);
            assert_eq!(event.attempts, 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_budget_exhausted_fails() {
            let api = Arc::new(ScriptedApi::default());
            {
                let mut failures = api.get_failures.lock().unwrap();
                for _ in 0..3 {
                    failures.push_back(TriggerError::Transient("503".to_string()));
                }
            }
            let event = trigger(Arc::clone(&api))
                .execute(&job(RolloutStrategy::RolloutRestart))
                .await;
            assert_eq!(event.outcome, ReloadOutcome::Failed);
            assert_eq!(event.attempts, 3);
            assert!(event.detail.unwrap().contains("retry budget exhausted"));
        }

        #[tokio::test]
        async fn test_forbidden_fails_immediately() {
            let api = Arc::new(ScriptedApi::default());
            api.patch_failures.lock().unwrap().push_back(TriggerError::Rejected {
                code: 403,
                message: "forbidden".to_string(),
            });
            let event = trigger(Arc::clone(&api))
                .execute(&job(RolloutStrategy::RolloutRestart))
                .await;
            assert_eq!(event.outcome, ReloadOutcome::Failed);
            assert_eq!(event.attempts, 1);
        }

        #[tokio::test]
        async fn test_missing_workload_is_skipped() {
            let api = Arc::new(ScriptedApi {
                missing: true,
                ..ScriptedApi::default()
            });
            let event = trigger(api).execute(&job(RolloutStrategy::RolloutRestart)).await;
            assert_eq!(event.outcome, ReloadOutcome::Skipped);
        }

        #[tokio::test(start_paused = true)]
        async fn test_attempt_deadline_counts_as_attempt() {
            let api = Arc::new(ScriptedApi {
                hang: true,
                ..ScriptedApi::default()
            });
            let event = trigger(api).execute(&job(RolloutStrategy::RolloutRestart)).await;
            assert_eq!(event.outcome, ReloadOutcome::Failed);
            assert_eq!(event.attempts, 3);
        }
    }

    #[test]
    fn test_kube_error_classification() {
        let api_error = |code: u16| {
            let response: kube::error::ErrorResponse = serde_json::from_value(serde_json::json!({
                "status": "Failure",
                "message": "boom",
                "reason": "",
                "code": code,
            }))
            .unwrap();
            kube::Error::Api(response)
        };
        assert!(matches!(TriggerError::from(api_error(404)), TriggerError::NotFound));
        assert!(TriggerError::from(api_error(409)).is_retryable());
        assert!(TriggerError::from(api_error(429)).is_retryable());
        assert!(TriggerError::from(api_error(503)).is_retryable());
        assert!(!TriggerError::from(api_error(403)).is_retryable());
        assert!(!TriggerError::from(api_error(422)).is_retryable());
    }
}
