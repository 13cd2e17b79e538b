//! Built-in notification sinks

use crate::controller::notifier::{Notification, NotificationSink, NotifyError};
use crate::resources::event::ReloadOutcome;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Writes every notification to the structured log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification {
            Notification::Reload(event) => {
                let fingerprint = event.new_fingerprint.as_ref().map(|f| f.short().to_string());
                if event.outcome == ReloadOutcome::Failed {
                    warn!(
                        event.id = %event.id,
                        workload.kind = event.workload.kind.as_str(),
                        workload.namespace = event.workload.namespace.as_str(),
                        workload.name = event.workload.name.as_str(),
                        resource.kind = event.resource.kind.as_str(),
                        resource.name = event.resource.name.as_str(),
                        outcome = event.outcome.as_str(),
                        attempts = event.attempts,
                        detail = event.detail.as_deref().unwrap_or_default(),
                        "Reload failed"
                    );
                } else {
                    info!(
                        event.id = %event.id,
                        workload.kind = event.workload.kind.as_str(),
                        workload.namespace = event.workload.namespace.as_str(),
                        workload.name = event.workload.name.as_str(),
                        resource.kind = event.resource.kind.as_str(),
                        resource.name = event.resource.name.as_str(),
                        fingerprint = fingerprint.as_deref().unwrap_or("deleted"),
                        outcome = event.outcome.as_str(),
                        attempts = event.attempts,
                        "Reload {}",
                        event.outcome
                    );
                }
            }
            Notification::Misconfiguration {
                workload, error, ..
            } => {
                warn!(
                    workload.kind = workload.kind.as_str(),
                    workload.namespace = workload.namespace.as_str(),
                    workload.name = workload.name.as_str(),
                    error = %error,
                    "Reload annotations misconfigured, workload will not be reloaded"
                );
            }
        }
        Ok(())
    }
}

/// Posts a one-line summary to a chat webhook (Slack/Teams/Mattermost
/// compatible `{"text": ...}` payload)
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": notification.summary() }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}
