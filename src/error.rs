//! Engine error taxonomy
//!
//! Every failure inside the engine is converted into an `EngineError` at the
//! boundary of the operation that produced it, then classified into a
//! `FailureKind` that decides how it is handled:
//! - Transient: retried through the resilience controller
//! - Exhaustion: surfaced as `Failed`, needs a manual reconnect
//! - Suspension: time-boxed, clears on its own
//! - Identity: never retried, forces a disconnect and re-authentication
//! - Protocol: fails the request; escalated during session validation

use std::time::Duration;

/// How a failure is handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Exhaustion,
    Suspension,
    Identity,
    Protocol,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Exhaustion => write!(f, "exhaustion"),
            Self::Suspension => write!(f, "suspension"),
            Self::Identity => write!(f, "identity"),
            Self::Protocol => write!(f, "protocol"),
        }
    }
}

/// Errors produced by engine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No matching response inside the allowed window
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// Send attempted while the transport is not open
    TransportNotReady,
    /// Socket-level failure (connect, send, unexpected close)
    Transport(String),
    /// Malformed or unexpected response
    Protocol(String),
    /// Device identity rejected or authentication missing
    Identity(String),
    /// Remote simulator call failed
    Simulator(String),
    /// Operation attempted on a disposed engine
    Disposed,
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } | Self::TransportNotReady | Self::Transport(_) => {
                FailureKind::Transient
            }
            Self::Simulator(_) => FailureKind::Transient,
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Identity(_) => FailureKind::Identity,
            Self::Disposed => FailureKind::Exhaustion,
        }
    }

    /// Short machine-readable reason used in logs and resilience records
    pub fn reason(&self) -> String {
        match self {
            Self::Timeout { operation, .. } => format!("{operation}_timeout"),
            Self::TransportNotReady => "transport_not_ready".to_string(),
            Self::Transport(_) => "transport_error".to_string(),
            Self::Protocol(_) => "protocol_error".to_string(),
            Self::Identity(_) => "identity_error".to_string(),
            Self::Simulator(_) => "simulator_error".to_string(),
            Self::Disposed => "disposed".to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { operation, after } => {
                write!(f, "{} timed out after {}ms", operation, after.as_millis())
            }
            Self::TransportNotReady => write!(f, "transport not ready"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Identity(e) => write!(f, "identity error: {}", e),
            Self::Simulator(e) => write!(f, "simulator error: {}", e),
            Self::Disposed => write!(f, "engine disposed"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let timeout = EngineError::Timeout {
            operation: "request_session",
            after: Duration::from_secs(15),
        };
        assert_eq!(timeout.kind(), FailureKind::Transient);
        assert_eq!(timeout.reason(), "request_session_timeout");
        assert_eq!(EngineError::TransportNotReady.kind(), FailureKind::Transient);
        assert_eq!(
            EngineError::Protocol("missing deviceId".into()).kind(),
            FailureKind::Protocol
        );
        assert_eq!(
            EngineError::Identity("device rejected".into()).kind(),
            FailureKind::Identity
        );
    }

    #[test]
    fn test_display() {
        let e = EngineError::Timeout {
            operation: "stop_session",
            after: Duration::from_millis(1500),
        };
        assert_eq!(e.to_string(), "stop_session timed out after 1500ms");
        assert_eq!(
            EngineError::Transport("refused".into()).to_string(),
            "transport error: refused"
        );
    }
}
