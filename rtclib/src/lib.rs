//! RTC Controller Library (rtclib)
//!
//! This library provides the control layer's interface to a telescope mount
//! controller: a supervised link, correlated command dispatch and telemetry
//! aggregation, composed behind `Controller`.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod connection;
pub mod link;
pub mod dispatcher;
pub mod telemetry;
pub mod controller;

pub use config::{load_config, ConfigFile, ControllerConfig};
pub use controller::*;
pub use dispatcher::{CommandHandle, CommandStatus, Dispatcher};
pub use link::{LinkHealth, LinkObserver, LinkSession, LinkState};
pub use telemetry::{SubscriptionHandle, TelemetryAggregator, TelemetryStats};
pub use rtcproto::*;

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
