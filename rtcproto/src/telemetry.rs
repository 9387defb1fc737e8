//! Telemetry definitions for RTC
//!
//! Telemetry is sent from the mount to the controller without being asked.

use serde::{Deserialize, Serialize};

use crate::types::{Position, Timestamp};

/// Motion status reported by the mount
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MotionStatus {
    Idle,
    Slewing,
    Tracking,
    Homing,
    Halted,
}

impl MotionStatus {
    pub fn is_moving(&self) -> bool {
        matches!(self, MotionStatus::Slewing | MotionStatus::Tracking | MotionStatus::Homing)
    }
}

/// Fault flag bit masks
pub mod fault_flags {
    pub const AZIMUTH_LIMIT: u32 = 0x0001;
    pub const ELEVATION_LIMIT: u32 = 0x0002;
    pub const MOTOR_STALL: u32 = 0x0004;
    pub const ENCODER_FAULT: u32 = 0x0008;
    pub const EMERGENCY_STOP: u32 = 0x0010;
}

/// Set of fault flags reported by the mount
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FaultFlags(pub u32);

impl FaultFlags {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Snapshot of telescope state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryFrame {
    /// Time the mount captured this state
    pub captured_at: Timestamp,
    pub position: Position,
    pub motion: MotionStatus,
    pub faults: FaultFlags,
}

impl TelemetryFrame {
    pub fn new(captured_at: Timestamp, position: Position, motion: MotionStatus) -> Self {
        Self {
            captured_at,
            position,
            motion,
            faults: FaultFlags::empty(),
        }
    }

    pub fn with_faults(mut self, faults: FaultFlags) -> Self {
        self.faults = faults;
        self
    }
}

/// Liveness frame exchanged in both directions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub sent_at: Timestamp,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            sent_at: Timestamp::now(),
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}
