//! Proxy error types.
//!
//! Startup failures (`LaunchFailed`, `ConnectTimeout`, `HandshakeFailed`) are
//! reported per backend; call-time failures surface to the caller unchanged.

use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::core::ConnectionState;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Backend '{backend}' failed to launch: {reason}")]
    LaunchFailed { backend: String, reason: String },

    #[error("Backend '{backend}' did not become ready within {timeout:?}")]
    ConnectTimeout { backend: String, timeout: Duration },

    #[error("Handshake with backend '{backend}' failed: {reason}")]
    HandshakeFailed { backend: String, reason: String },

    #[error("Protocol error from backend '{backend}': {reason}")]
    Protocol { backend: String, reason: String },

    #[error("Transport to backend '{backend}' was lost: {reason}")]
    TransportLost { backend: String, reason: String },

    #[error("Backend '{backend}' is unavailable (state: {state})")]
    BackendUnavailable {
        backend: String,
        state: ConnectionState,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("No backends available: {}", format_failures(.0))]
    NoBackendsAvailable(Vec<BackendFailure>),

    /// JSON-RPC error returned by the backend for a tool call.
    #[error("Backend '{backend}' returned error {code} for '{tool}': {message}")]
    Backend {
        backend: String,
        tool: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ProxyError {
    /// Backend the error is attributed to, when there is one.
    pub fn backend(&self) -> Option<&str> {
        match self {
            ProxyError::LaunchFailed { backend, .. }
            | ProxyError::ConnectTimeout { backend, .. }
            | ProxyError::HandshakeFailed { backend, .. }
            | ProxyError::Protocol { backend, .. }
            | ProxyError::TransportLost { backend, .. }
            | ProxyError::BackendUnavailable { backend, .. }
            | ProxyError::Backend { backend, .. } => Some(backend),
            ProxyError::BackendNotFound(name) => Some(name),
            _ => None,
        }
    }

    /// True for failures raised while bringing a connection up.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::LaunchFailed { .. }
                | ProxyError::ConnectTimeout { .. }
                | ProxyError::HandshakeFailed { .. }
        )
    }
}

/// Why a single backend did not come up during startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
}

impl BackendFailure {
    pub fn new(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

fn format_failures(failures: &[BackendFailure]) -> String {
    if failures.is_empty() {
        return "no backend could be started".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_backends_lists_every_cause() {
        let err = ProxyError::NoBackendsAvailable(vec![
            BackendFailure::new("a", "launch failed"),
            BackendFailure::new("b", "timed out"),
        ]);
        let message = err.to_string();
        assert!(message.contains("a: launch failed"), "got: {message}");
        assert!(message.contains("b: timed out"), "got: {message}");
    }

    #[test]
    fn test_backend_attribution() {
        let err = ProxyError::TransportLost {
            backend: "echo".to_string(),
            reason: "closed".to_string(),
        };
        assert_eq!(err.backend(), Some("echo"));
        assert!(!err.is_startup_failure());

        let err = ProxyError::ConnectTimeout {
            backend: "slow".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_startup_failure());
        assert_eq!(ProxyError::ToolNotFound("x".into()).backend(), None);
    }

    #[test]
    fn test_unavailable_mentions_state() {
        let err = ProxyError::BackendUnavailable {
            backend: "echo".to_string(),
            state: ConnectionState::Errored,
        };
        assert_eq!(
            err.to_string(),
            "Backend 'echo' is unavailable (state: errored)"
        );
    }
}
