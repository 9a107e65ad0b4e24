//! Logging setup and redaction helpers.
//!
//! The core logs through `tracing`. Anything that may carry a password,
//! key or plaintext is wrapped in one of the redacting adapters below before
//! it reaches a log line or a `Debug` impl.

use std::fmt;
use tracing_subscriber::EnvFilter;

/// Install a `tracing-subscriber` fmt subscriber.
///
/// `RUST_LOG` overrides `default_directive`. Safe to call more than once;
/// later calls are no-ops.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Show a short hex prefix of a public value (ids, public keys).
pub struct ShortHex<'a>(pub &'a [u8]);

impl<'a> fmt::Display for ShortHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len().min(4);
        write!(f, "{}", hex::encode(&self.0[..n]))?;
        if self.0.len() > n {
            write!(f, "..")?;
        }
        Ok(())
    }
}

impl<'a> fmt::Debug for ShortHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Field names that must never be logged verbatim.
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "private",
    "key",
    "token",
    "auth",
    "credential",
];

/// Check if a string appears to contain sensitive data.
pub fn appears_sensitive(s: &str) -> bool {
    let lower = s.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitize a string for logging, redacting sensitive patterns.
pub fn sanitize_for_log(s: &str) -> String {
    if appears_sensitive(s) {
        "[REDACTED]".to_string()
    } else {
        s.to_string()
    }
}
