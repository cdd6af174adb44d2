//! Engine error taxonomy
//!
//! Every failure the engine reports to a caller is an [`EngineError`].
//! Errors are `Clone` so the same cause can be handed to a waiting
//! command, recorded on the session and published on the event bus.

use crate::core::transport::TransportError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the session engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Opening the port failed (permissions, device removed, already open)
    #[error("Port unavailable: {port}: {reason}")]
    PortUnavailable {
        /// Port path
        port: String,
        /// Failure class
        fault: PortFault,
        /// Reason reported by the port layer
        reason: String,
    },

    /// Command submitted to a session that is not open
    #[error("Session not connected: {0}")]
    SessionNotConnected(String),

    /// No session matches the given id or port path
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// No line matched the response pattern in time
    #[error("Command timed out after {}ms waiting for '{pattern}'", timeout.as_millis())]
    CommandTimeout {
        /// Response pattern that was armed
        pattern: String,
        /// Request timeout
        timeout: Duration,
    },

    /// Read or write failure in the middle of a session
    #[error("I/O failure on session {session}: {reason}")]
    IoFailure {
        /// Session that failed
        session: Uuid,
        /// Underlying cause
        reason: String,
    },

    /// A script `assert` step evaluated to false
    #[error("Assertion failed: {0}")]
    ScriptAssertionFailed(String),

    /// A script wait step did not complete in time
    #[error("Script step timed out after {}ms: {what}", timeout.as_millis())]
    ScriptTimeout {
        /// What the step was waiting for
        what: String,
        /// Step timeout
        timeout: Duration,
    },

    /// The script task was cancelled
    #[error("Script cancelled")]
    ScriptCancelled,

    /// A line pattern failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Pattern source
        pattern: String,
        /// Compiler message
        reason: String,
    },

    /// Command text could not be turned into bytes
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No task with this id
    #[error("Unknown task: {0}")]
    UnknownTask(Uuid),

    /// No macro with this name
    #[error("Unknown macro: {0}")]
    UnknownMacro(String),

    /// Macro name taken or an entry does not parse
    #[error("Invalid macro: {0}")]
    InvalidMacro(String),

    /// The engine is shutting down
    #[error("Engine is shut down")]
    Shutdown,
}

/// Why a port could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortFault {
    /// The port is not present
    NotFound,
    /// The OS refused access
    PermissionDenied,
    /// Another session or process holds the port
    InUse,
    /// The serial parameters were rejected
    Rejected,
    /// Any other open failure
    Failed,
}

impl From<&TransportError> for PortFault {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::PortNotFound(_) => Self::NotFound,
            TransportError::PermissionDenied(_) => Self::PermissionDenied,
            TransportError::PortInUse(_) => Self::InUse,
            TransportError::InvalidConfiguration(_) => Self::Rejected,
            TransportError::IoError(io) => match io.kind() {
                std::io::ErrorKind::NotFound => Self::NotFound,
                std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                _ => Self::Failed,
            },
            TransportError::ConnectionFailed(_) | TransportError::Enumeration(_) => Self::Failed,
        }
    }
}

impl EngineError {
    /// Open failure of `port` caused by `err`
    pub fn port_unavailable(port: &str, err: &TransportError) -> Self {
        Self::PortUnavailable {
            port: port.to_string(),
            fault: PortFault::from(err),
            reason: err.to_string(),
        }
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PortUnavailable { .. } => "port_unavailable",
            Self::SessionNotConnected(_) => "session_not_connected",
            Self::UnknownSession(_) => "unknown_session",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::IoFailure { .. } => "io_failure",
            Self::ScriptAssertionFailed(_) => "script_assertion_failed",
            Self::ScriptTimeout { .. } => "script_timeout",
            Self::ScriptCancelled => "script_cancelled",
            Self::InvalidPattern { .. } => "invalid_pattern",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::UnknownTask(_) => "unknown_task",
            Self::UnknownMacro(_) => "unknown_macro",
            Self::InvalidMacro(_) => "invalid_macro",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the error is a timeout of some kind
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. } | Self::ScriptTimeout { .. })
    }
}
