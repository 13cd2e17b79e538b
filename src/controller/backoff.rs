//! # Exponential Backoff
//!
//! Delay calculator for rollout retries and watch restarts.
//!
//! Each delay doubles the previous one, starting at `start_ms` and capped at
//! `max_ms`. Callers own one instance per retry loop, so concurrent rollouts
//! never share backoff state.
//!
//! ## Usage
//!
//! ```rust
//! use config_reloader::controller::backoff::ExponentialBackoff;
//!
//! let mut backoff = ExponentialBackoff::new(200, 1_000);
//! assert_eq!(backoff.next_backoff_ms(), 200);
//! assert_eq!(backoff.next_backoff_ms(), 400);
//! assert_eq!(backoff.next_backoff_ms(), 800);
//! assert_eq!(backoff.next_backoff_ms(), 1_000);
//! ```

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay in milliseconds (for reset)
    start_ms: u64,
    /// Delay returned by the next call
    current_ms: u64,
    /// Cap in milliseconds
    max_ms: u64,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `start_ms`, never exceeding `max_ms`
    ///
    /// A zero start is bumped to 1ms so the sequence can grow.
    #[must_use]
    pub fn new(start_ms: u64, max_ms: u64) -> Self {
        let start_ms = start_ms.max(1);
        let max_ms = max_ms.max(start_ms);
        Self {
            start_ms,
            current_ms: start_ms,
            max_ms,
        }
    }

    /// Get the next delay in milliseconds and advance the sequence
    pub fn next_backoff_ms(&mut self) -> u64 {
        let result = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);
        result
    }

    /// Get the next delay as a `Duration` and advance the sequence
    ///
    /// ```
    /// use config_reloader::controller::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    ///
    /// let mut backoff = ExponentialBackoff::new(100, 10_000);
    /// assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
    /// ```
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_millis(self.next_backoff_ms())
    }

    /// Reset to the initial delay
    pub fn reset(&mut self) {
        self.current_ms = self.start_ms;
    }
}
