//! # Controller
//!
//! Core controller modules for the Config Reloader.
//!
//! - `backoff`: Exponential backoff for rollout retries
//! - `engine`: Per-workload reload decisions and pause windows
//! - `fingerprint`: Content fingerprints of ConfigMaps and Secrets
//! - `index`: Tracked resources, workloads and the reverse dependency index
//! - `notifier`: Audit log and notification sinks
//! - `policy`: Annotation parsing into reload policies
//! - `reloader`: Pipeline from resource changes to rollouts
//! - `resolver`: Dependent workload resolution
//! - `server`: HTTP server for metrics and health checks
//! - `trigger`: Rollout execution and the worker pool
//! - `watcher`: Watch event bookkeeping

pub mod backoff;
pub mod engine;
pub mod fingerprint;
pub mod index;
pub mod notifier;
pub mod policy;
pub mod reloader;
pub mod resolver;
pub mod server;
pub mod trigger;
pub mod watcher;
