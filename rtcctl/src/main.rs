//! RTC Console Controller (rtcctl)
//!
//! Operator console for a telescope mount:
//!
//! ```text
//! rtcctl [config.json]        default rtcontrol.json
//! ```
//!
//! Commands are read from stdin one per line; link transitions and changes
//! in the mount's motion or faults are printed as they happen.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};
use rtclib::{load_config, Controller, FaultFlags, MotionStatus};

use crate::commands::{parse_line, ConsoleCommand, ParseError, HELP};

mod commands;
mod display;

const DEFAULT_CONFIG: &str = "rtcontrol.json";

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let (endpoint, config) = match load_config(&path) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Cannot load {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    info!("RTCCtl connecting to mount at {}", endpoint);
    let controller = match Controller::start(endpoint, config) {
        Ok(controller) => Arc::new(controller),
        Err(e) => {
            error!("Cannot start controller: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let events = controller.connection_events();
    thread::spawn(move || {
        for state in events {
            println!("link {}", state);
        }
    });

    let mut last_shown: Option<(MotionStatus, FaultFlags)> = None;
    let subscribed = controller.subscribe_telemetry(move |frame| {
        let shown = (frame.motion, frame.faults);
        if last_shown != Some(shown) {
            println!("{}", display::format_telemetry(frame));
            last_shown = Some(shown);
        }
    });
    if let Err(e) = subscribed {
        warn!("Telemetry will not be printed: {}", e);
    }

    // Set up Ctrl+C handler
    let stopper = Arc::clone(&controller);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        stopper.stop();
        std::process::exit(0);
    }) {
        warn!("Cannot install Ctrl+C handler: {}", e);
    }

    println!("{}", HELP);
    prompt();
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Cannot read stdin: {}", e);
                break;
            }
        };

        match parse_line(&line) {
            Ok(ConsoleCommand::Quit) => break,
            Ok(command) => execute(&controller, command),
            Err(ParseError::Empty) => {}
            Err(e) => println!("{}", e),
        }
        prompt();
    }

    controller.stop();
    ExitCode::SUCCESS
}

fn prompt() {
    print!("rtc> ");
    let _ = io::stdout().flush();
}

fn execute(controller: &Controller, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Issue(params) => {
            let kind = params.kind();
            match controller.issue_command(params) {
                Ok(handle) => match handle.wait() {
                    Ok(()) => println!("{} {} acknowledged", kind, handle.correlation()),
                    Err(e) => println!("{} {} failed: {}", kind, handle.correlation(), e),
                },
                Err(e) => println!("{} not sent: {}", kind, e),
            }
        }
        ConsoleCommand::Status => {
            println!("{}", display::format_health(&controller.connection_health()));
            println!(
                "{}",
                display::format_stats(&controller.telemetry_stats(), controller.telemetry_is_stale())
            );
            println!("pending commands {}", controller.pending_commands());
            match controller.latest_telemetry() {
                Some(frame) => println!("{}", display::format_telemetry(&frame)),
                None => println!("no telemetry yet"),
            }
        }
        ConsoleCommand::Reconnect => controller.resync(),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}
