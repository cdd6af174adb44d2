//! CLI Exit Codes
//!
//! Exit codes per error class, for use from shell scripts and CI.

use crate::config::ConfigError;
use crate::core::error::{EngineError, PortFault};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Port could not be opened
    pub const PORT_UNAVAILABLE: u8 = 3;

    /// Command timed out
    pub const TIMEOUT: u8 = 4;

    /// Session not connected
    pub const NOT_CONNECTED: u8 = 5;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// I/O failure during a session
    pub const IO_FAILURE: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Script failed
    pub const SCRIPT_ERROR: u8 = 15;

    /// Script assertion failed
    pub const ASSERTION_FAILED: u8 = 16;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for the user
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&EngineError> for CliResult {
    fn from(err: &EngineError) -> Self {
        let code = match err {
            EngineError::PortUnavailable { fault, .. } => match fault {
                PortFault::NotFound => ExitCodes::PORT_NOT_FOUND,
                PortFault::PermissionDenied => ExitCodes::PERMISSION_DENIED,
                PortFault::InUse | PortFault::Rejected | PortFault::Failed => ExitCodes::PORT_UNAVAILABLE,
            },
            EngineError::SessionNotConnected(_) => ExitCodes::NOT_CONNECTED,
            EngineError::UnknownSession(_) => ExitCodes::PORT_NOT_FOUND,
            EngineError::CommandTimeout { .. } => ExitCodes::TIMEOUT,
            EngineError::IoFailure { .. } => ExitCodes::IO_FAILURE,
            EngineError::ScriptAssertionFailed(_) => ExitCodes::ASSERTION_FAILED,
            EngineError::ScriptTimeout { .. } => ExitCodes::SCRIPT_ERROR,
            EngineError::ScriptCancelled | EngineError::Shutdown => ExitCodes::CANCELLED,
            EngineError::InvalidPattern { .. }
            | EngineError::InvalidPayload(_)
            | EngineError::UnknownMacro(_)
            | EngineError::InvalidMacro(_) => ExitCodes::INVALID_ARGS,
            EngineError::UnknownTask(_) => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<EngineError> for CliResult {
    fn from(err: EngineError) -> Self {
        Self::from(&err)
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(io) => Self::from(io),
            other => Self::Error(ExitCodes::CONFIG_ERROR, other.to_string()),
        }
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

/// Every documented code with its description, in ascending order
const TABLE: &[(u8, &str)] = &[
    (ExitCodes::SUCCESS, "Success"),
    (ExitCodes::ERROR, "General error"),
    (ExitCodes::INVALID_ARGS, "Invalid arguments"),
    (ExitCodes::PORT_UNAVAILABLE, "Port unavailable"),
    (ExitCodes::TIMEOUT, "Command timeout"),
    (ExitCodes::NOT_CONNECTED, "Session not connected"),
    (ExitCodes::FILE_NOT_FOUND, "File not found"),
    (ExitCodes::PERMISSION_DENIED, "Permission denied"),
    (ExitCodes::CONFIG_ERROR, "Configuration error"),
    (ExitCodes::IO_FAILURE, "I/O failure"),
    (ExitCodes::CANCELLED, "Operation cancelled"),
    (ExitCodes::PORT_NOT_FOUND, "Port not found"),
    (ExitCodes::SCRIPT_ERROR, "Script error"),
    (ExitCodes::ASSERTION_FAILED, "Assertion failed"),
    (ExitCodes::INTERNAL_ERROR, "Internal error"),
];

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("Unknown error", |(_, text)| text)
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for (code, text) in TABLE {
        println!("  {code:>3}  {text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Port unavailable");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Port unavailable"));
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(exit_code_description(ExitCodes::IO_FAILURE), "I/O failure");
        assert_eq!(exit_code_description(ExitCodes::INTERNAL_ERROR), "Internal error");
        assert_eq!(exit_code_description(42), "Unknown error");
    }

    #[test]
    fn test_from_engine_error() {
        let timeout = EngineError::CommandTimeout {
            pattern: "PONG".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(CliResult::from(&timeout).code(), ExitCodes::TIMEOUT);
        assert_eq!(
            CliResult::from(EngineError::ScriptAssertionFailed("hot".into())).code(),
            ExitCodes::ASSERTION_FAILED
        );
        let missing = EngineError::PortUnavailable {
            port: "/dev/ttyUSB9".into(),
            fault: PortFault::NotFound,
            reason: "Port not found: /dev/ttyUSB9".into(),
        };
        assert_eq!(CliResult::from(missing).code(), ExitCodes::PORT_NOT_FOUND);

        // The class decides the code, whatever the OS wording
        let denied = EngineError::PortUnavailable {
            port: "COM7".into(),
            fault: PortFault::PermissionDenied,
            reason: "Access is denied.".into(),
        };
        assert_eq!(CliResult::from(denied).code(), ExitCodes::PERMISSION_DENIED);
        let busy = EngineError::PortUnavailable {
            port: "COM7".into(),
            fault: PortFault::InUse,
            reason: "device not found in lock table".into(),
        };
        assert_eq!(CliResult::from(busy).code(), ExitCodes::PORT_UNAVAILABLE);
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(ConfigError::Io(err));
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
        assert_eq!(
            CliResult::from(ConfigError::Invalid("bad".into())).code(),
            ExitCodes::CONFIG_ERROR
        );
    }
}
