//! # Notifier
//!
//! Every notification is recorded in a bounded in-memory audit log before it
//! is handed to the sinks. Sink delivery runs on spawned tasks with a deadline,
//! so a slow or failing sink never blocks the pipeline and never loses the
//! audit record.

pub mod sinks;

pub use sinks::{LogSink, WebhookSink};

use crate::controller::policy::PolicyError;
use crate::observability::metrics;
use crate::resources::event::ReloadEvent;
use crate::resources::identity::WorkloadId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Reload(ReloadEvent),
    /// A workload's reload annotations could not be parsed
    Misconfiguration {
        workload: WorkloadId,
        error: PolicyError,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    #[must_use]
    pub fn misconfiguration(workload: WorkloadId, error: PolicyError) -> Self {
        Notification::Misconfiguration {
            workload,
            error,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Notification::Reload(event) => event.summary(),
            Notification::Misconfiguration {
                workload, error, ..
            } => format!("Reload disabled for {workload}: misconfigured annotations ({error})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink responded with status {0}")]
    Status(u16),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// A destination for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Label used in logs and the failure metric
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

struct NotifierInner {
    audit_log: Mutex<VecDeque<Notification>>,
    capacity: usize,
    sinks: Vec<Arc<dyn NotificationSink>>,
    delivery_timeout: Duration,
}

/// Shared handle to the audit log and sinks
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("capacity", &self.inner.capacity)
            .field(
                "sinks",
                &self.inner.sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Notifier {
    #[must_use]
    pub fn new(
        capacity: usize,
        sinks: Vec<Arc<dyn NotificationSink>>,
        delivery_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(NotifierInner {
                audit_log: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                sinks,
                delivery_timeout,
            }),
        }
    }

    /// Record the notification, then fan it out to every sink in the background
    ///
    /// Must be called from within a Tokio runtime.
    pub fn notify(&self, notification: Notification) {
        self.record(notification.clone());

        if self.inner.sinks.is_empty() {
            return;
        }
        let notification = Arc::new(notification);
        for sink in &self.inner.sinks {
            let sink = Arc::clone(sink);
            let notification = Arc::clone(&notification);
            let timeout = self.inner.delivery_timeout;
            tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout, sink.deliver(&notification)).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(NotifyError::Timeout(timeout)),
                };
                match result {
                    Ok(()) => debug!(sink = sink.name(), "Notification delivered"),
                    Err(e) => {
                        warn!(sink = sink.name(), error = %e, "Notification delivery failed");
                        metrics::increment_notification_failures(sink.name());
                    }
                }
            });
        }
    }

    fn record(&self, notification: Notification) {
        let mut log = self
            .inner
            .audit_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if log.len() == self.inner.capacity {
            log.pop_front();
        }
        log.push_back(notification);
    }

    /// Snapshot of the audit log, oldest first
    #[must_use]
    pub fn audit_log(&self) -> Vec<Notification> {
        self.inner
            .audit_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Reload events in the audit log, oldest first
    #[must_use]
    pub fn reload_events(&self) -> Vec<ReloadEvent> {
        self.inner
            .audit_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|notification| match notification {
                Notification::Reload(event) => Some(event.clone()),
                Notification::Misconfiguration { .. } => None,
            })
            .collect()
    }
}
