//! # Reload Events
//!
//! Immutable records of what happened to one (resource, workload) pair.

use crate::controller::fingerprint::Fingerprint;
use crate::resources::identity::{ResourceId, WorkloadId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadOutcome {
    Succeeded,
    Failed,
    /// No rollout was needed or possible (workload gone, dependency deleted)
    Skipped,
    /// A pending pause-window reload was cancelled
    SkippedPaused,
}

impl ReloadOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadOutcome::Succeeded => "succeeded",
            ReloadOutcome::Failed => "failed",
            ReloadOutcome::Skipped => "skipped",
            ReloadOutcome::SkippedPaused => "skipped-paused",
        }
    }
}

impl fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub workload: WorkloadId,
    pub resource: ResourceId,
    pub old_fingerprint: Option<Fingerprint>,
    /// `None` when the triggering resource was deleted
    pub new_fingerprint: Option<Fingerprint>,
    pub outcome: ReloadOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReloadEvent {
    pub fn new(
        workload: WorkloadId,
        resource: ResourceId,
        old_fingerprint: Option<Fingerprint>,
        new_fingerprint: Option<Fingerprint>,
        outcome: ReloadOutcome,
        attempts: u32,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            workload,
            resource,
            old_fingerprint,
            new_fingerprint,
            outcome,
            attempts,
            detail,
        }
    }

    /// One-line human summary, used by chat sinks
    #[must_use]
    pub fn summary(&self) -> String {
        let fingerprint = self
            .new_fingerprint
            .as_ref()
            .map_or("deleted", Fingerprint::short);
        let mut line = format!(
            "Reload {} for {} triggered by {} ({}) after {} attempt(s)",
            self.outcome, self.workload, self.resource, fingerprint, self.attempts
        );
        if let Some(detail) = &self.detail {
            line.push_str(": ");
            line.push_str(detail);
        }
        line
    }
}
