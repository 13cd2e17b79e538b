//! # Runtime
//!
//! Process startup, the watch loop and watch error handling.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
