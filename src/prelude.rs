//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use config_reloader::prelude::*;
//! ```

// Identities and tracked state
pub use crate::resources::event::{ReloadEvent, ReloadOutcome};
pub use crate::resources::identity::{ResourceId, ResourceKind, WorkloadId, WorkloadKind};
pub use crate::resources::watched::{ObservedResource, WatchedResource};
pub use crate::resources::workload::{ObservedWorkload, WorkloadRef};

// Policy
pub use crate::controller::policy::{
    AnnotationKeys, PolicyDefaults, PolicyError, ReloadMode, ReloadPolicy, RolloutStrategy,
};

// Pipeline
pub use crate::controller::fingerprint::Fingerprint;
pub use crate::controller::index::ResourceIndex;
pub use crate::controller::notifier::{Notification, NotificationSink, Notifier, NotifyError};
pub use crate::controller::reloader::{Reloader, ReloaderError};
pub use crate::controller::trigger::{
    Dispatcher, RolloutJob, RolloutQueue, RolloutSettings, RolloutTrigger, TriggerError,
    WorkloadApi, WorkloadSnapshot,
};

// Config types - for configuration management
pub use crate::config::{ControllerConfig, ServerConfig};
