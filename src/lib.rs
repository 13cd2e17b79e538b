//! Config Reloader Library
//!
//! Watches ConfigMaps and Secrets and rolls out the Deployments, StatefulSets
//! and DaemonSets that consume them when their content changes.
//! Tests are included in the module files and under `tests/`.
//!
//! ## Quick Start
//!
//! ```rust
//! use config_reloader::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod observability;
pub mod prelude;
pub mod resources;
pub mod runtime;
