//! # Error Handling
//!
//! This module defines the error type shared by every part of the session core.
//!
//! ## Error taxonomy:
//! - **Establishment failures** (`InvalidTarget`, `ConnectFailed`, `Timeout`): returned by
//!   `connect()`; the caller decides whether to retry
//! - **Lifecycle** (`Transport`, `Closed`, `RetriesExhausted`): the connection went away and will not
//!   come back on its own
//! - **Data** (`Protocol`, `Codec`): a frame could not be decoded; logged and discarded
//! - **Service**: the remote reported an error event; forwarded to error observers
//! - **Devices** (`Device`, `PermissionDenied`): microphone or speaker unavailable
//! - **Setup** (`NotConfigured`, `Config`)
//!
//! ## Why Clone:
//! A single in-flight connect attempt is shared by every concurrent `connect()` caller,
//! and each of them receives its own copy of the outcome.

use std::fmt;

/// Error type for the realtime session core.
///
/// ## Usage Example:
/// ```rust
/// use realtime_voice_session::error::SessionError;
/// let err = SessionError::NotConfigured("no target".to_string());
/// assert!(err.to_string().contains("no target"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The connection target could not be turned into a transport request
    InvalidTarget(String),

    /// The transport could not be opened or the remote rejected the handshake
    ConnectFailed(String),

    /// Establishment did not finish within the configured connect timeout
    Timeout(String),

    /// The transport reported an error after it was established
    Transport(String),

    /// The connection was closed (explicitly or by the remote)
    Closed(String),

    /// Automatic reconnection gave up after this many consecutive attempts
    RetriesExhausted(u32),

    /// An inbound or outbound frame violated the JSON envelope contract
    Protocol(String),

    /// The remote service reported an error event
    Service(String),

    /// Audio payload could not be encoded or decoded
    Codec(String),

    /// An audio device could not be opened or failed while running
    Device(String),

    /// The platform refused access to the microphone
    PermissionDenied(String),

    /// An operation needed a target/credential or component that was never supplied
    NotConfigured(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Anything else
    Internal(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidTarget(msg) => write!(f, "Invalid connection target: {}", msg),
            SessionError::ConnectFailed(msg) => write!(f, "Connection failed: {}", msg),
            SessionError::Timeout(msg) => write!(f, "Connection timed out: {}", msg),
            SessionError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SessionError::Closed(msg) => write!(f, "Connection closed: {}", msg),
            SessionError::RetriesExhausted(attempts) => {
                write!(f, "Reconnect gave up after {} attempts", attempts)
            }
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::Service(msg) => write!(f, "Service error: {}", msg),
            SessionError::Codec(msg) => write!(f, "Audio codec error: {}", msg),
            SessionError::Device(msg) => write!(f, "Audio device error: {}", msg),
            SessionError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            SessionError::NotConfigured(msg) => write!(f, "Not configured: {}", msg),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SessionError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// Machine-readable error code, used in status payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidTarget(_) => "invalid_target",
            SessionError::ConnectFailed(_) => "connect_failed",
            SessionError::Timeout(_) => "timeout",
            SessionError::Transport(_) => "transport_error",
            SessionError::Closed(_) => "closed",
            SessionError::RetriesExhausted(_) => "retries_exhausted",
            SessionError::Protocol(_) => "protocol_error",
            SessionError::Service(_) => "service_error",
            SessionError::Codec(_) => "codec_error",
            SessionError::Device(_) => "device_error",
            SessionError::PermissionDenied(_) => "permission_denied",
            SessionError::NotConfigured(_) => "not_configured",
            SessionError::Config(_) => "config_error",
            SessionError::Internal(_) => "internal_error",
        }
    }
}

/// Automatic conversion from anyhow::Error.
///
/// Handlers and device backends use anyhow internally; anything that reaches the
/// session boundary this way is treated as an internal error.
impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Internal(err.to_string())
    }
}

/// JSON failures are always envelope problems.
impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::ConnectFailed(err.to_string())
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::Codec(format!("base64 decode failed: {}", err))
    }
}

/// Shorthand for `Result<T, SessionError>`.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_message() {
        let err = SessionError::ConnectFailed("handshake rejected (401)".to_string());
        assert_eq!(err.to_string(), "Connection failed: handshake rejected (401)");
        assert_eq!(err.code(), "connect_failed");
    }

    #[test]
    fn test_json_error_becomes_protocol_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SessionError = parse_err.into();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = SessionError::RetriesExhausted(5);
        assert_eq!(err.to_string(), "Reconnect gave up after 5 attempts");
    }
}
