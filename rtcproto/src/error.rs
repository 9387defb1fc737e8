//! Error definitions for RTC

use std::fmt;
use thiserror::Error;

use crate::commands::{AckCode, CommandKind};

/// Why a command resolved as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The mount answered with an error code
    Rejected(AckCode),
    /// No ack arrived before the command's deadline
    Timeout,
    /// The link dropped while the command was pending
    LinkLost,
    /// The controller was stopped while the command was pending
    Shutdown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected(code) => write!(f, "rejected by mount: {}", code),
            FailureReason::Timeout => f.write_str("timed out waiting for ack"),
            FailureReason::LinkLost => f.write_str("link lost"),
            FailureReason::Shutdown => f.write_str("controller shut down"),
        }
    }
}

/// RTC error types
#[derive(Error, Debug)]
pub enum RtcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Link not ready")]
    LinkNotReady,

    #[error("Command conflict: a {0} command is already pending")]
    CommandConflict(CommandKind),

    #[error("Command failed: {0}")]
    Command(FailureReason),

    #[error("Link session already started")]
    AlreadyStarted,

    #[error("Controller used after stop")]
    Stopped,
}

impl RtcError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        RtcError::MalformedFrame(reason.into())
    }

    /// The failure reason if this error is a command resolution
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            RtcError::Command(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<FailureReason> for RtcError {
    fn from(reason: FailureReason) -> Self {
        RtcError::Command(reason)
    }
}

/// Result type alias for RTC operations
pub type RtcResult<T> = Result<T, RtcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RtcError::Config("test".to_string());
        assert_eq!(format!("{}", err), "Configuration error: test");

        let err = RtcError::CommandConflict(CommandKind::Move);
        assert_eq!(err.to_string(), "Command conflict: a MOVE command is already pending");

        let err = RtcError::from(FailureReason::Rejected(AckCode::Busy));
        assert_eq!(err.to_string(), "Command failed: rejected by mount: busy");
    }

    #[test]
    fn test_failure_reason() {
        assert_eq!(RtcError::Command(FailureReason::Timeout).failure_reason(), Some(FailureReason::Timeout));
        assert_eq!(RtcError::LinkNotReady.failure_reason(), None);
    }
}
