//! Configuration for the controller

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use rtcproto::{Endpoint, RtcError, RtcResult};

use self::constants::*;

/// Timing and behaviour of the controller core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Keep trying to connect in the background instead of failing fast
    pub autoconnect: bool,
    /// Bound on a single connect attempt
    pub connect_timeout_ms: u64,
    /// Expected spacing of inbound frames and of our own heartbeats
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat windows before the link is declared lost
    pub max_missed_heartbeats: u32,
    /// First reconnect delay, doubled on every failed attempt
    pub reconnect_delay_init_ms: u64,
    /// Ceiling for the reconnect delay
    pub reconnect_delay_max_ms: u64,
    /// Deadline for a command's ack
    pub command_timeout_ms: u64,
    /// Number of recent telemetry frames kept
    pub telemetry_history: usize,
    /// Telemetry older than this is reported as stale
    pub telemetry_stale_after_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            autoconnect: true,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            max_missed_heartbeats: MAX_MISSED_HEARTBEATS,
            reconnect_delay_init_ms: RECONNECT_DELAY_INIT_MS,
            reconnect_delay_max_ms: RECONNECT_DELAY_MAX_MS,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            telemetry_history: TELEMETRY_HISTORY,
            telemetry_stale_after_ms: TELEMETRY_STALE_AFTER_MS,
        }
    }
}

impl ControllerConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get initial reconnect delay as Duration
    pub fn reconnect_delay_init(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_init_ms)
    }

    /// Get maximum reconnect delay as Duration
    pub fn reconnect_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_max_ms)
    }

    /// Get command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Get telemetry staleness bound as Duration
    pub fn telemetry_stale_after(&self) -> Duration {
        Duration::from_millis(self.telemetry_stale_after_ms)
    }

    /// Socket read timeout of the session thread
    ///
    /// Liveness is checked once per tick, so it has to be a fraction of the
    /// heartbeat interval.
    pub fn tick(&self) -> Duration {
        (self.heartbeat_interval() / 4).max(MIN_TICK)
    }

    /// Reconnect delay after `attempts` consecutive failures
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts.min(31)).unwrap_or(u64::MAX);
        let delay_ms = self.reconnect_delay_init_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.reconnect_delay_max_ms))
    }

    /// Reject settings the link cannot work with
    pub fn validate(&self) -> RtcResult<()> {
        let nonzero = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reconnect_delay_init_ms", self.reconnect_delay_init_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("telemetry_stale_after_ms", self.telemetry_stale_after_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(RtcError::Config(format!("{} must be greater than zero", name)));
        }

        if self.max_missed_heartbeats == 0 {
            return Err(RtcError::Config("max_missed_heartbeats must be at least 1".to_string()));
        }

        if self.telemetry_history == 0 {
            return Err(RtcError::Config("telemetry_history must be at least 1".to_string()));
        }

        if self.reconnect_delay_init_ms > self.reconnect_delay_max_ms {
            return Err(RtcError::Config(format!(
                "reconnect_delay_init_ms ({}) exceeds reconnect_delay_max_ms ({})",
                self.reconnect_delay_init_ms, self.reconnect_delay_max_ms
            )));
        }

        if self.heartbeat_interval_ms >= self.command_timeout_ms {
            return Err(RtcError::Config(format!(
                "heartbeat_interval_ms ({}) must be shorter than command_timeout_ms ({})",
                self.heartbeat_interval_ms, self.command_timeout_ms
            )));
        }

        Ok(())
    }
}

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Load the mount endpoint and controller configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> RtcResult<(Endpoint, ControllerConfig)> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config_file: ConfigFile = serde_json::from_reader(reader)?;

    config_file.controller.validate()?;
    info!("Loaded configuration from {} (mount at {})", path.display(), config_file.endpoint);

    Ok((config_file.endpoint, config_file.controller))
}

/// Configuration constants
pub mod constants {
    use std::time::Duration;

    pub const CONNECT_TIMEOUT_MS: u64 = 2000;

    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    pub const MAX_MISSED_HEARTBEATS: u32 = 3;

    /// Initial delay for reconnect attempts
    pub const RECONNECT_DELAY_INIT_MS: u64 = 250;

    /// Maximum delay for reconnect attempts
    pub const RECONNECT_DELAY_MAX_MS: u64 = 10_000;

    pub const COMMAND_TIMEOUT_MS: u64 = 3000;

    pub const TELEMETRY_HISTORY: usize = 32;

    pub const TELEMETRY_STALE_AFTER_MS: u64 = 5000;

    /// Lower bound on the session thread's read timeout
    pub const MIN_TICK: Duration = Duration::from_millis(5);

    /// Read buffer size of the session thread
    pub const READ_BUFFER_SIZE: usize = 4096;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert!(config.autoconnect);
        assert!(config.validate().is_ok());
        assert!(config.heartbeat_interval() < config.command_timeout());
        assert_eq!(config.tick(), Duration::from_millis(250));
    }

    #[test]
    fn test_reconnect_backoff() {
        let config = ControllerConfig {
            reconnect_delay_init_ms: 100,
            reconnect_delay_max_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(800));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let config = ControllerConfig {
            heartbeat_interval_ms: 3000,
            command_timeout_ms: 3000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RtcError::Config(_))));

        let config = ControllerConfig {
            max_missed_heartbeats: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            reconnect_delay_init_ms: 20_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config() {
        let config_json = r#"{
            "endpoint": { "host": "192.168.1.50", "port": 10001 },
            "controller": {
                "autoconnect": false,
                "heartbeat_interval_ms": 500,
                "command_timeout_ms": 4000
            }
        }"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_json.as_bytes()).unwrap();

        let (endpoint, config) = load_config(temp_file.path()).unwrap();
        assert_eq!(endpoint, Endpoint::new("192.168.1.50", 10001));
        assert!(!config.autoconnect);
        assert_eq!(config.heartbeat_interval_ms, 500);
        assert_eq!(config.command_timeout_ms, 4000);
        assert_eq!(config.max_missed_heartbeats, MAX_MISSED_HEARTBEATS);
    }

    #[test]
    fn test_load_config_without_controller_section() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{ "endpoint": { "host": "localhost", "port": 4000 } }"#)
            .unwrap();

        let (endpoint, config) = load_config(temp_file.path()).unwrap();
        assert_eq!(endpoint.port, 4000);
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_load_config_invalid() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{ "endpoint": { "host": "localhost", "port": 4000 }, "controller": { "max_missed_heartbeats": 0 } }"#)
            .unwrap();
        assert!(matches!(load_config(temp_file.path()), Err(RtcError::Config(_))));

        assert!(matches!(load_config("/nonexistent/rtc.json"), Err(RtcError::Io(_))));
    }
}
