//! # Duration Parsing
//!
//! Parses pause-period annotation values.
//!
//! Accepts one or more `<number><unit>` groups with units `ms`, `s`, `m`, `h`, `d`
//! (e.g. `"30s"`, `"5m"`, `"1h30m"`). Zero-length periods are rejected.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<number>\d+)(?P<unit>ms|s|m|h|d)")
        .expect("Failed to compile duration regex - this should never happen")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("duration cannot be empty")]
    Empty,
    #[error("invalid duration format '{0}', expected e.g. '30s', '5m', '1h30m'")]
    InvalidFormat(String),
    #[error("duration '{0}' is out of range")]
    OutOfRange(String),
    #[error("duration must be greater than 0, got '{0}'")]
    Zero(String),
}

/// Parse a pause-period duration string
pub fn parse_duration(duration_str: &str) -> Result<Duration, DurationError> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }
    let lower = trimmed.to_lowercase();

    let mut total_ms: u64 = 0;
    let mut consumed = 0;
    for captures in SEGMENT.captures_iter(&lower) {
        let whole = captures
            .get(0)
            .ok_or_else(|| DurationError::InvalidFormat(trimmed.to_string()))?;
        // Segments must be contiguous; anything between them is garbage.
        if whole.start() != consumed {
            return Err(DurationError::InvalidFormat(trimmed.to_string()));
        }
        consumed = whole.end();

        let number: u64 = captures["number"]
            .parse()
            .map_err(|_e| DurationError::OutOfRange(trimmed.to_string()))?;
        let unit_ms: u64 = match &captures["unit"] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(DurationError::InvalidFormat(trimmed.to_string())),
        };
        total_ms = number
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| DurationError::OutOfRange(trimmed.to_string()))?;
    }

    if consumed == 0 || consumed != lower.len() {
        return Err(DurationError::InvalidFormat(trimmed.to_string()));
    }
    if total_ms == 0 {
        return Err(DurationError::Zero(trimmed.to_string()));
    }
    Ok(Duration::from_millis(total_ms))
}
