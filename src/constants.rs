//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default annotation domain (`reloader.<domain>/auto`, ...)
pub const DEFAULT_ANNOTATION_DOMAIN: &str = "stakater.com";

/// Default rollout strategy when a workload does not choose one
pub const DEFAULT_ROLLOUT_STRATEGY: &str = "restart";

/// Default number of rollout workers
pub const DEFAULT_MAX_CONCURRENT_ROLLOUTS: usize = 4;

/// Default rollout queue capacity; producers wait when it is full
pub const DEFAULT_ROLLOUT_QUEUE_CAPACITY: usize = 256;

/// Default number of attempts per rollout, first attempt included
pub const DEFAULT_ROLLOUT_MAX_ATTEMPTS: u32 = 5;

/// Default deadline for one rollout attempt (seconds)
pub const DEFAULT_ROLLOUT_ATTEMPT_TIMEOUT_SECS: u64 = 10;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default deadline for one notification delivery (seconds)
pub const DEFAULT_NOTIFICATION_TIMEOUT_SECS: u64 = 5;

/// Default number of notifications kept in the in-memory audit log
pub const DEFAULT_AUDIT_LOG_CAPACITY: usize = 1000;

/// Field manager recorded on workload patches
pub const DEFAULT_FIELD_MANAGER: &str = "config-reloader";
