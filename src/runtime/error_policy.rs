//! # Error Policy
//!
//! Classification and backoff for watch stream errors.

use crate::observability;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn, Instrument};

/// What the watch loop should do after a stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorAction {
    /// Keep consuming the stream
    Continue,
    /// Drop the stream and restart it (the watcher relists)
    Restart,
}

/// Classified watch stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    Unauthorized,
    Expired,
    Throttled,
    NotFound,
    Other,
}

impl WatchErrorKind {
    /// Classify from the error's debug representation
    #[must_use]
    pub fn classify(error_string: &str) -> Self {
        // 404 first: a plain-text 404 body surfaces as a serde error inside WatchFailed.
        let is_not_found = error_string.contains("ObjectNotFound")
            || error_string.contains("404")
            || error_string.contains("not found");
        let is_unauthorized = (error_string.contains("401")
            || error_string.contains("Unauthorized")
            || error_string.contains("403")
            || error_string.contains("Forbidden"))
            && !is_not_found;
        let is_expired = error_string.contains("410")
            || error_string.contains("too old resource version")
            || error_string.contains("Expired")
            || error_string.contains("Gone");
        let is_throttled = error_string.contains("429")
            || error_string.contains("storage is (re)initializing")
            || error_string.contains("TooManyRequests");

        if is_unauthorized {
            WatchErrorKind::Unauthorized
        } else if is_expired {
            WatchErrorKind::Expired
        } else if is_throttled {
            WatchErrorKind::Throttled
        } else if is_not_found {
            WatchErrorKind::NotFound
        } else {
            WatchErrorKind::Other
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchErrorKind::Unauthorized => "unauthorized",
            WatchErrorKind::Expired => "expired",
            WatchErrorKind::Throttled => "throttled",
            WatchErrorKind::NotFound => "not_found",
            WatchErrorKind::Other => "other",
        }
    }
}

/// Handle watch stream errors with appropriate classification and backoff
///
/// Sleeps where the error calls for it, then tells the caller whether to keep
/// the stream or restart it.
pub async fn handle_watch_stream_error(
    stream: &str,
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay_secs: u64,
) -> WatchErrorAction {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        stream = stream,
        error = %error_string
    );
    classify_and_wait(stream, error_string, backoff, max_backoff_ms, watch_restart_delay_secs)
        .instrument(error_span)
        .await
}

async fn classify_and_wait(
    stream: &str,
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay_secs: u64,
) -> WatchErrorAction {
    let kind = WatchErrorKind::classify(error_string);
    observability::metrics::increment_watch_errors(stream, kind.as_str());

    match kind {
        WatchErrorKind::Unauthorized => {
            error!(
                "Watch of {} rejected (401/403) - RBAC may have been revoked or token expired",
                stream
            );
            error!("   Verify the ClusterRole grants get/list/watch on configmaps, secrets,");
            error!("   deployments, statefulsets and daemonsets, and patch on the workloads:");
            error!("      kubectl auth can-i watch configmaps --as=system:serviceaccount:<namespace>:config-reloader --all-namespaces");
            warn!(
                "Waiting {}s before retrying watch (RBAC may need time to propagate)...",
                watch_restart_delay_secs
            );
            tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
            WatchErrorAction::Restart
        }
        WatchErrorKind::Expired => {
            warn!(
                "Watch resource version expired (410) for {}, relisting",
                stream
            );
            WatchErrorAction::Restart
        }
        WatchErrorKind::Throttled => {
            let current_backoff = backoff.load(Ordering::Relaxed);
            warn!(
                "API server throttling or reinitializing (429), backing off for {}ms before restart...",
                current_backoff
            );
            tokio::time::sleep(Duration::from_millis(current_backoff)).await;
            let new_backoff = current_backoff.saturating_mul(2).min(max_backoff_ms);
            backoff.store(new_backoff, Ordering::Relaxed);
            WatchErrorAction::Restart
        }
        WatchErrorKind::NotFound => {
            warn!(
                "Watch of {} returned not found (404), continuing. Error: {}",
                stream, error_string
            );
            WatchErrorAction::Continue
        }
        WatchErrorKind::Other => {
            error!("Watch stream error on {}: {}", stream, error_string);
            tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
            WatchErrorAction::Restart
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classify_tests {
        use super::*;

        #[test]
        fn test_classifies_status_codes() {
            assert_eq!(
                WatchErrorKind::classify("Api(ErrorResponse { code: 401, reason: \"Unauthorized\" })"),
                WatchErrorKind::Unauthorized
            );
            assert_eq!(
                WatchErrorKind::classify("WatchError(ErrorResponse { code: 410, reason: \"Expired\" })"),
                WatchErrorKind::Expired
            );
            assert_eq!(
                WatchErrorKind::classify("storage is (re)initializing"),
                WatchErrorKind::Throttled
            );
            assert_eq!(
                WatchErrorKind::classify("InitialListFailed(invalid type: integer `404`)"),
                WatchErrorKind::NotFound
            );
            assert_eq!(
                WatchErrorKind::classify("connection reset by peer"),
                WatchErrorKind::Other
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_doubles_backoff_up_to_max() {
        let backoff = Arc::new(AtomicU64::new(1_000));
        let action = handle_watch_stream_error("ConfigMap/*", "429 TooManyRequests", &backoff, 1_500, 1).await;
        assert_eq!(action, WatchErrorAction::Restart);
        assert_eq!(backoff.load(Ordering::Relaxed), 1_500);
    }

    #[tokio::test]
    async fn test_not_found_keeps_stream() {
        let backoff = Arc::new(AtomicU64::new(1_000));
        let action = handle_watch_stream_error("Secret/team-a", "ObjectNotFound", &backoff, 2_000, 0).await;
        assert_eq!(action, WatchErrorAction::Continue);
        assert_eq!(backoff.load(Ordering::Relaxed), 1_000);
    }
}
