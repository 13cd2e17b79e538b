//! # Resources
//!
//! Domain types shared by every pipeline stage.

pub mod event;
pub mod identity;
pub mod watched;
pub mod workload;

pub use event::{ReloadEvent, ReloadOutcome};
pub use identity::{ResourceId, ResourceKind, WorkloadId, WorkloadKind};
pub use watched::{ObservedResource, ResourceChanged, WatchedResource};
pub use workload::{ObservedWorkload, WorkloadRef};
