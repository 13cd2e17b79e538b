//! # Reloader
//!
//! Wires the pipeline stages together: a watch signal is resolved to its
//! dependent workloads, each (resource, workload) pair is decided on
//! independently, and the outcome is either queued for the rollout workers,
//! deferred into a pause window, or recorded straight to the notifier.

use crate::controller::engine::{decide, Decision, PauseScheduler, Scheduled};
use crate::controller::index::ResourceIndex;
use crate::controller::notifier::{Notification, Notifier};
use crate::controller::policy::{PolicyError, ReloadMode, ReloadPolicy, RolloutStrategy};
use crate::controller::resolver::{resolve, Candidate};
use crate::controller::trigger::dispatcher::QueueClosed;
use crate::controller::trigger::{RolloutJob, RolloutQueue};
use crate::controller::watcher::{ResourceSignal, WorkloadSignal};
use crate::observability::metrics;
use crate::resources::event::{ReloadEvent, ReloadOutcome};
use crate::resources::identity::WorkloadId;
use crate::resources::watched::{ResourceChanged, WatchedResource};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum ReloaderError {
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// Controller instance state shared by every watch stream
#[derive(Debug)]
pub struct Reloader {
    index: Arc<ResourceIndex>,
    pauses: PauseScheduler,
    queue: RolloutQueue,
    notifier: Notifier,
}

impl Reloader {
    #[must_use]
    pub fn new(index: Arc<ResourceIndex>, queue: RolloutQueue, notifier: Notifier) -> Self {
        Self {
            index,
            pauses: PauseScheduler::new(queue.clone()),
            queue,
            notifier,
        }
    }

    #[must_use]
    pub fn index(&self) -> &Arc<ResourceIndex> {
        &self.index
    }

    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    #[must_use]
    pub fn pending_paused(&self) -> usize {
        self.pauses.pending_count()
    }

    /// React to a ConfigMap/Secret watch signal
    ///
    /// Fails only when the rollout queue has shut down.
    pub async fn handle_resource_signal(&self, signal: ResourceSignal) -> Result<(), ReloaderError> {
        match signal {
            ResourceSignal::Changed(changed) => self.on_resource_changed(changed).await,
            ResourceSignal::Deleted(resource) => {
                self.on_resource_deleted(&resource);
                Ok(())
            }
        }
    }

    /// React to a workload watch signal
    pub fn handle_workload_signal(&self, signal: WorkloadSignal) {
        match signal {
            WorkloadSignal::Applied(id, update) => {
                if update.annotations_changed {
                    if let Some(Err(error)) = self.index.workload_policy(&id) {
                        self.report_misconfiguration(&id, &error);
                    }
                }
            }
            WorkloadSignal::Deleted(id) => {
                if let Some(job) = self.pauses.cancel_workload(&id) {
                    info!("Workload {} deleted, cancelling its pending paused reload", id);
                    self.record(
                        ReloadEvent::new(
                            job.workload,
                            job.resource,
                            job.old_fingerprint,
                            Some(job.new_fingerprint),
                            ReloadOutcome::SkippedPaused,
                            0,
                            Some("workload deleted during pause window".to_string()),
                        ),
                        Some(job.strategy),
                    );
                }
            }
        }
    }

    async fn on_resource_changed(&self, changed: ResourceChanged) -> Result<(), ReloaderError> {
        let Some(resource) = self.index.resource(&changed.id) else {
            debug!(resource = %changed.id, "Resource no longer tracked, ignoring change");
            return Ok(());
        };

        let span = tracing::span!(
            tracing::Level::INFO,
            "controller.resource_changed",
            resource.kind = changed.id.kind.as_str(),
            resource.namespace = changed.id.namespace.as_str(),
            resource.name = changed.id.name.as_str(),
            fingerprint = changed.new_fingerprint.short()
        );
        self.react(&resource, &changed).instrument(span).await
    }

    async fn react(
        &self,
        resource: &WatchedResource,
        changed: &ResourceChanged,
    ) -> Result<(), ReloaderError> {
        let candidates = resolve(&self.index, resource);
        debug!(dependents = candidates.len(), "Resolved dependents");

        for Candidate { workload, policy } in candidates {
            match decide(&policy, resource, &self.index.defaults().keys) {
                Decision::SkipDisabled => {
                    if let Err(error) = &policy {
                        self.report_misconfiguration(&workload, error);
                    }
                    debug!(
                        workload.kind = workload.kind.as_str(),
                        workload.name = workload.name.as_str(),
                        decision = "skip-disabled",
                        "Reload policy disabled"
                    );
                }
                Decision::SkipIgnored => {
                    debug!(
                        workload.kind = workload.kind.as_str(),
                        workload.name = workload.name.as_str(),
                        decision = "skip-ignored",
                        "Resource ignored"
                    );
                }
                Decision::TriggerNow => {
                    let job = self.job(workload, changed, &policy);
                    info!(
                        workload.kind = job.workload.kind.as_str(),
                        workload.name = job.workload.name.as_str(),
                        decision = "trigger-now",
                        strategy = job.strategy.as_str(),
                        "Queueing rollout"
                    );
                    // Block the stream rather than drop work when the queue is full.
                    self.queue.submit(job).await?;
                }
                Decision::TriggerAfterPause(window) => {
                    let job = self.job(workload, changed, &policy);
                    let workload = job.workload.clone();
                    let scheduled = self.pauses.schedule(job, window);
                    info!(
                        workload.kind = workload.kind.as_str(),
                        workload.name = workload.name.as_str(),
                        decision = "trigger-after-pause",
                        window_secs = window.as_secs(),
                        coalesced = scheduled == Scheduled::Coalesced,
                        "Deferring rollout to pause window"
                    );
                }
            }
        }
        Ok(())
    }

    fn on_resource_deleted(&self, resource: &WatchedResource) {
        info!(resource = %resource.id, "Resource deleted, dependents left dangling");

        let mut handled = BTreeSet::new();
        for job in self.pauses.cancel_resource(&resource.id) {
            handled.insert(job.workload.clone());
            self.record(
                ReloadEvent::new(
                    job.workload,
                    job.resource,
                    job.old_fingerprint,
                    Some(job.new_fingerprint),
                    ReloadOutcome::SkippedPaused,
                    0,
                    Some("dependency deleted during pause window".to_string()),
                ),
                Some(job.strategy),
            );
        }

        for Candidate { workload, policy } in resolve(&self.index, resource) {
            if handled.contains(&workload) {
                continue;
            }
            let enabled = matches!(&policy, Ok(p) if p.mode != ReloadMode::Disabled);
            let ignored = matches!(
                decide(&policy, resource, &self.index.defaults().keys),
                Decision::SkipIgnored
            );
            if !enabled || ignored {
                continue;
            }
            self.record(
                ReloadEvent::new(
                    workload,
                    resource.id.clone(),
                    Some(resource.content_fingerprint.clone()),
                    None,
                    ReloadOutcome::Skipped,
                    0,
                    Some("dependency deleted".to_string()),
                ),
                None,
            );
        }
    }

    fn job(
        &self,
        workload: WorkloadId,
        changed: &ResourceChanged,
        policy: &Result<Arc<ReloadPolicy>, PolicyError>,
    ) -> RolloutJob {
        let strategy = policy
            .as_ref()
            .map_or(self.index.defaults().strategy, |p| p.strategy);
        RolloutJob {
            workload,
            resource: changed.id.clone(),
            old_fingerprint: changed.old_fingerprint.clone(),
            new_fingerprint: changed.new_fingerprint.clone(),
            strategy,
        }
    }

    fn report_misconfiguration(&self, workload: &WorkloadId, error: &PolicyError) {
        if !self.index.mark_misconfig_reported(workload) {
            return;
        }
        warn!(
            workload.kind = workload.kind.as_str(),
            workload.namespace = workload.namespace.as_str(),
            workload.name = workload.name.as_str(),
            error = %error,
            "Reload annotations misconfigured"
        );
        metrics::increment_policy_misconfigurations();
        self.notifier
            .notify(Notification::misconfiguration(workload.clone(), error.clone()));
    }

    fn record(&self, event: ReloadEvent, strategy: Option<RolloutStrategy>) {
        metrics::increment_reloads(
            event.outcome.as_str(),
            strategy.map_or("none", |s| s.as_str()),
        );
        self.notifier.notify(Notification::Reload(event));
    }
}
