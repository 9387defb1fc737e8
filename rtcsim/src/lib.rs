//! RTC Mount Simulator (rtcsim)
//!
//! Stands in for the telescope mount: `ScriptedPeer` for deterministic tests
//! of the controller and `MountSimulator` for manual end-to-end runs.

pub mod peer;
pub mod mount;

pub use peer::*;
pub use mount::*;
