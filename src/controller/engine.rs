//! # Reload Policy Engine
//!
//! [`decide`] turns a workload's policy and the changed resource into one of
//! four decisions, checked in order:
//!
//! 1. disabled or misconfigured policy: skip
//! 2. resource excluded by the workload, or annotated `reloader.<domain>/ignore`: skip
//! 3. pause period set: trigger once the window elapses
//! 4. otherwise: trigger now
//!
//! [`PauseScheduler`] owns the open pause windows. A window opens on the first
//! change for a workload and closes at a fixed deadline; changes arriving while
//! it is open replace the pending job (latest resource and fingerprint win)
//! without extending the deadline.

use crate::controller::policy::{annotation_enabled, AnnotationKeys, PolicyError, ReloadMode, ReloadPolicy};
use crate::controller::trigger::{RolloutJob, RolloutQueue};
use crate::observability::metrics;
use crate::resources::identity::{ResourceId, WorkloadId};
use crate::resources::watched::WatchedResource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    TriggerNow,
    TriggerAfterPause(Duration),
    SkipIgnored,
    SkipDisabled,
}

/// Decide what to do for one (resource, workload) pair
#[must_use]
pub fn decide(
    policy: &Result<Arc<ReloadPolicy>, PolicyError>,
    resource: &WatchedResource,
    keys: &AnnotationKeys,
) -> Decision {
    let policy = match policy {
        Ok(policy) if policy.mode != ReloadMode::Disabled => policy,
        _ => return Decision::SkipDisabled,
    };
    if policy.ignored_resources.contains(&resource.id)
        || annotation_enabled(&resource.annotations, &keys.ignore)
    {
        return Decision::SkipIgnored;
    }
    match policy.pause_window {
        Some(window) => Decision::TriggerAfterPause(window),
        None => Decision::TriggerNow,
    }
}

/// Result of [`PauseScheduler::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// A new window was opened
    Opened,
    /// The change was folded into an open window
    Coalesced,
}

#[derive(Debug)]
struct PendingReload {
    job: RolloutJob,
    token: u64,
    timer: AbortHandle,
}

type PendingReloads = Arc<Mutex<HashMap<WorkloadId, PendingReload>>>;

/// Open pause windows, one per workload
#[derive(Debug)]
pub struct PauseScheduler {
    pending: PendingReloads,
    queue: RolloutQueue,
    next_token: AtomicU64,
}

impl PauseScheduler {
    #[must_use]
    pub fn new(queue: RolloutQueue) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue,
            next_token: AtomicU64::new(0),
        }
    }

    /// Defer `job` until the workload's pause window elapses
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, job: RolloutJob, window: Duration) -> Scheduled {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(open) = pending.get_mut(&job.workload) {
            // Keep the fingerprint the window started from when the same resource changes again.
            let old_fingerprint = if open.job.resource == job.resource {
                open.job.old_fingerprint.clone()
            } else {
                job.old_fingerprint.clone()
            };
            open.job = RolloutJob {
                old_fingerprint,
                ..job
            };
            debug!("Coalesced change into open pause window for {}", open.job.workload);
            return Scheduled::Coalesced;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let workload = job.workload.clone();
        let timer = tokio::spawn(fire_after(
            Arc::clone(&self.pending),
            self.queue.clone(),
            workload.clone(),
            token,
            window,
        ))
        .abort_handle();

        debug!(
            window_secs = window.as_secs(),
            "Opened pause window for {}", workload
        );
        pending.insert(workload, PendingReload { job, token, timer });
        metrics::set_pending_paused_reloads(i64::try_from(pending.len()).unwrap_or(i64::MAX));
        Scheduled::Opened
    }

    /// Cancel the open window of a workload, returning the job that would have run
    pub fn cancel_workload(&self, workload: &WorkloadId) -> Option<RolloutJob> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = pending.remove(workload).map(|reload| {
            reload.timer.abort();
            reload.job
        });
        metrics::set_pending_paused_reloads(i64::try_from(pending.len()).unwrap_or(i64::MAX));
        cancelled
    }

    /// Cancel every open window whose pending job was triggered by `resource`
    pub fn cancel_resource(&self, resource: &ResourceId) -> Vec<RolloutJob> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let workloads: Vec<WorkloadId> = pending
            .iter()
            .filter(|(_, reload)| &reload.job.resource == resource)
            .map(|(workload, _)| workload.clone())
            .collect();
        let cancelled = workloads
            .iter()
            .filter_map(|workload| pending.remove(workload))
            .map(|reload| {
                reload.timer.abort();
                reload.job
            })
            .collect();
        metrics::set_pending_paused_reloads(i64::try_from(pending.len()).unwrap_or(i64::MAX));
        cancelled
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for PauseScheduler {
    fn drop(&mut self) {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for reload in pending.values() {
            reload.timer.abort();
        }
    }
}

async fn fire_after(
    pending: PendingReloads,
    queue: RolloutQueue,
    workload: WorkloadId,
    token: u64,
    window: Duration,
) {
    tokio::time::sleep(window).await;

    let job = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        // A cancelled window may have been replaced by a newer one for the same workload.
        let current = pending.get(&workload).is_some_and(|r| r.token == token);
        let job = if current {
            pending.remove(&workload).map(|r| r.job)
        } else {
            None
        };
        metrics::set_pending_paused_reloads(i64::try_from(pending.len()).unwrap_or(i64::MAX));
        job
    };

    if let Some(job) = job {
        debug!("Pause window elapsed for {}", workload);
        if let Err(e) = queue.submit(job).await {
            warn!(error = %e, "Dropping paused reload for {}", workload);
        }
    }
}
