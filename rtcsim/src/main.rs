//! RTC Mount Simulator (rtcsim)
//!
//! A dummy telescope mount for trying out the controller:
//!
//! ```text
//! rtcsim [listen-addr]        default 127.0.0.1:4500
//! ```
//!
//! Moves are range checked (azimuth `[0, 360)`, elevation `[0, 90]`), the
//! axes slew linearly toward their target and telemetry is streamed every
//! 200 ms.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use log::{error, info, warn};
use rtcsim::{MountConfig, MountSimulator};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4500";

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let listen = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid listen address {}: {}", listen, e);
            return ExitCode::FAILURE;
        }
    };

    info!("RTCSim mount simulator starting up");

    let simulator = match MountSimulator::bind(addr, MountConfig::default()) {
        Ok(simulator) => simulator,
        Err(e) => {
            error!("Cannot listen on {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    // Set up Ctrl+C handler
    let running = simulator.running();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    }) {
        warn!("Cannot install Ctrl+C handler: {}", e);
    }

    match simulator.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Simulator failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
