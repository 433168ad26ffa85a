//! Logging helpers
//!
//! Small formatters used by the connection and transport layers when they
//! emit `tracing` events.

use std::time::Duration;

/// Format duration in human-readable form
///
/// # Example
///
/// ```rust
/// use rta::logging::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_millis(2700)), "2.70s");
/// assert_eq!(format_duration(Duration::from_millis(300)), "300ms");
/// assert_eq!(format_duration(Duration::from_secs(60)), "1m0s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros < 1000 {
        format!("{}μs", micros)
    } else if micros < 1_000_000 {
        format!("{}ms", micros / 1000)
    } else if micros < 60_000_000 {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    } else {
        let seconds = micros / 1_000_000;
        format!("{}m{}s", seconds / 60, seconds % 60)
    }
}

/// Mask a bearer token so only its length and last four characters survive
///
/// ```rust
/// use rta::logging::redact_token;
///
/// assert_eq!(redact_token("abcdefghij"), "******ghij");
/// assert_eq!(redact_token("abc"), "***");
/// ```
pub fn redact_token(token: &str) -> String {
    let count = token.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = token.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), tail)
}
