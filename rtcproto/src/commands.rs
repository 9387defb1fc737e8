//! Command definitions for RTC
//!
//! Commands are sent from the controller to the mount. Each one is answered
//! by exactly one ack carrying the same correlation id.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RtcError, RtcResult};
use crate::types::{CorrelationId, Timestamp};

/// Command types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Move,
    Halt,
    SetTrackingRate,
    Home,
    SetParameter,
}

impl CommandKind {
    /// Only one command of an exclusive kind may be outstanding at a time.
    /// Halt is never exclusive so it can always be sent.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, CommandKind::Move | CommandKind::Home)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Ping => "PING",
            CommandKind::Move => "MOVE",
            CommandKind::Halt => "HALT",
            CommandKind::SetTrackingRate => "SET_TRACKING_RATE",
            CommandKind::Home => "HOME",
            CommandKind::SetParameter => "SET_PARAMETER",
        };
        f.write_str(name)
    }
}

/// Parameter payload of a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CommandParams {
    /// Verify the mount is processing commands
    Ping,
    /// Slew to an absolute azimuth/elevation in degrees
    Move { azimuth: f64, elevation: f64 },
    /// Stop all axis motion
    Halt,
    /// Track at a constant rate in degrees per second
    SetTrackingRate { azimuth_rate: f64, elevation_rate: f64 },
    /// Drive both axes to the home position
    Home,
    /// Set a named controller parameter
    SetParameter { name: String, value: f64 },
}

impl CommandParams {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandParams::Ping => CommandKind::Ping,
            CommandParams::Move { .. } => CommandKind::Move,
            CommandParams::Halt => CommandKind::Halt,
            CommandParams::SetTrackingRate { .. } => CommandKind::SetTrackingRate,
            CommandParams::Home => CommandKind::Home,
            CommandParams::SetParameter { .. } => CommandKind::SetParameter,
        }
    }

    /// Reject values JSON cannot carry
    ///
    /// NaN and infinities would go out as `null` and the mount would drop
    /// the connection on the unparseable frame.
    pub fn validate(&self) -> RtcResult<()> {
        let values: &[(&str, f64)] = match self {
            CommandParams::Move { azimuth, elevation } => {
                &[("azimuth", *azimuth), ("elevation", *elevation)]
            }
            CommandParams::SetTrackingRate {
                azimuth_rate,
                elevation_rate,
            } => &[("azimuth_rate", *azimuth_rate), ("elevation_rate", *elevation_rate)],
            CommandParams::SetParameter { value, .. } => &[("value", *value)],
            CommandParams::Ping | CommandParams::Halt | CommandParams::Home => &[],
        };

        match values.iter().find(|(_, value)| !value.is_finite()) {
            Some((name, value)) => Err(RtcError::InvalidParameter(format!(
                "{} {} is {}",
                self.kind(),
                name,
                value
            ))),
            None => Ok(()),
        }
    }
}

/// A command as it travels on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub correlation: CorrelationId,
    pub params: CommandParams,
    pub issued_at: Timestamp,
}

impl Command {
    pub fn new(correlation: CorrelationId, params: CommandParams) -> Self {
        Self {
            correlation,
            params,
            issued_at: Timestamp::now(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.params.kind()
    }
}

/// Result code carried by an ack
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AckCode {
    Accepted,
    InvalidParameter,
    Busy,
    Fault,
    Unsupported,
}

impl AckCode {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AckCode::Accepted)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AckCode::Accepted => "accepted",
            AckCode::InvalidParameter => "invalid parameter",
            AckCode::Busy => "busy",
            AckCode::Fault => "mount fault",
            AckCode::Unsupported => "unsupported",
        };
        f.write_str(text)
    }
}

/// Acknowledgement of a command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub correlation: CorrelationId,
    pub code: AckCode,
}

impl Ack {
    pub fn new(correlation: CorrelationId, code: AckCode) -> Self {
        Self { correlation, code }
    }

    pub fn accepted(correlation: CorrelationId) -> Self {
        Self::new(correlation, AckCode::Accepted)
    }
}
