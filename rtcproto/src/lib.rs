//! RTC Controller/Mount Library (rtcproto)
//!
//! This library contains definitions shared between the controller side of
//! the software (rtclib) and anything speaking for the mount (rtcsim): the
//! command and telemetry types, the wire codec and the error taxonomy.

pub mod types;
pub mod commands;
pub mod telemetry;
pub mod protocol;
pub mod error;

pub use types::*;
pub use commands::*;
pub use telemetry::*;
pub use protocol::*;
pub use error::*;
