//! Semantic checks on a loaded [`RemoteConfig`].

use std::fmt;

use crate::schema::RemoteConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "auth.timeout_secs"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn error(path: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            path: path.to_string(),
            message: message.into(),
        }
    }

    fn warning(path: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.severity, self.path, self.message)
    }
}

/// Check value ranges and combinations the type system cannot express.
pub fn validate(config: &RemoteConfig) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let auth = &config.auth;

    if auth.timeout_secs == 0 {
        out.push(Diagnostic::error(
            "auth.timeout_secs",
            "must be greater than zero",
        ));
    }
    if auth.poll_interval_ms == 0 {
        out.push(Diagnostic::error(
            "auth.poll_interval_ms",
            "must be greater than zero",
        ));
    }
    if auth.max_attempts == 0 {
        out.push(Diagnostic::error(
            "auth.max_attempts",
            "must be at least 1",
        ));
    }
    if let Some(stale) = auth.stale_lock_secs
        && stale <= auth.timeout_secs
    {
        out.push(Diagnostic::warning(
            "auth.stale_lock_secs",
            "not longer than auth.timeout_secs; a live owner may be taken over mid-authorization",
        ));
    }

    let host = config.callback.host.as_str();
    if host.is_empty() {
        out.push(Diagnostic::error("callback.host", "must not be empty"));
    } else if !matches!(host, "127.0.0.1" | "localhost" | "::1" | "[::1]") {
        out.push(Diagnostic::warning(
            "callback.host",
            format!("`{host}` is not a loopback address; the redirect may be reachable from other hosts"),
        ));
    }

    if config.client.name.trim().is_empty() {
        out.push(Diagnostic::error("client.name", "must not be empty"));
    }

    out
}
