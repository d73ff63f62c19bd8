use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the bridge.
///
/// `Clone` so a single event (a crash, a shutdown) can be delivered to every
/// waiter that was pending at the time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// The worker executable could not be launched.
    #[error("failed to spawn worker: {0}")]
    ProcessSpawn(String),

    /// A request was attempted while the worker is not running, or the worker
    /// went away while the request was pending.
    #[error("worker process is not running")]
    ProcessNotRunning,

    /// Request parameters cannot be put on the wire. No I/O was attempted.
    #[error("failed to encode request: {0}")]
    Encoding(String),

    /// Worker output could not be interpreted. Malformed lines are only logged;
    /// callers see this when a result does not match the type they asked for.
    #[error("failed to decode worker output: {0}")]
    Decoding(String),

    /// The worker answered with `success: false`.
    #[error("worker error: {message}")]
    Backend {
        message: String,
        details: Option<String>,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    pub fn backend(message: impl Into<String>, details: Option<String>) -> Self {
        Self::Backend {
            message: message.into(),
            details,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Traceback or other diagnostic text attached by the worker, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Backend { details, .. } => details.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_displays_message_only() {
        let err = BridgeError::backend("Note not found", Some("Traceback ...".to_string()));
        assert_eq!(err.to_string(), "worker error: Note not found");
        assert_eq!(err.details(), Some("Traceback ..."));
    }

    #[test]
    fn timeout_is_detectable() {
        let err = BridgeError::Timeout(Duration::from_secs(30));
        assert!(err.is_timeout());
        assert!(!BridgeError::ProcessNotRunning.is_timeout());
        assert_eq!(err.details(), None);
    }
}
