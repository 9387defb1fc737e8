//! Text formatting for rtcctl

use rtclib::{fault_flags, FaultFlags, LinkHealth, TelemetryFrame, TelemetryStats, Timestamp};

/// Format a timestamp as UTC time of day
pub fn format_timestamp(timestamp: Timestamp) -> String {
    let total_secs = timestamp.seconds % 86400; // Seconds in a day
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let millis = timestamp.nanoseconds / 1_000_000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

pub fn format_faults(faults: FaultFlags) -> String {
    if faults.is_empty() {
        return "none".to_string();
    }

    let names = [
        (fault_flags::AZIMUTH_LIMIT, "azimuth-limit"),
        (fault_flags::ELEVATION_LIMIT, "elevation-limit"),
        (fault_flags::MOTOR_STALL, "motor-stall"),
        (fault_flags::ENCODER_FAULT, "encoder-fault"),
        (fault_flags::EMERGENCY_STOP, "emergency-stop"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(flag, _)| faults.has_flag(*flag))
        .map(|(_, name)| *name)
        .collect();
    set.join(",")
}

pub fn format_telemetry(frame: &TelemetryFrame) -> String {
    format!(
        "{} {} {:?} faults={}",
        format_timestamp(frame.captured_at),
        frame.position,
        frame.motion,
        format_faults(frame.faults)
    )
}

pub fn format_health(health: &LinkHealth) -> String {
    let endpoint = health
        .endpoint
        .as_ref()
        .map_or_else(|| "-".to_string(), |e| e.to_string());
    let silence = health
        .since_last_inbound
        .map_or_else(|| "-".to_string(), |d| format!("{}ms", d.as_millis()));
    format!(
        "link {} to {} (connections {}, retries {}, last inbound {} ago)",
        health.state, endpoint, health.connections, health.reconnect_attempts, silence
    )
}

pub fn format_stats(stats: &TelemetryStats, stale: bool) -> String {
    format!(
        "telemetry applied {}, discarded {}, subscribers {}{}",
        stats.applied,
        stats.discarded,
        stats.subscribers,
        if stale { " (stale)" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtclib::{LinkState, MotionStatus, Position};

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(Timestamp::from_millis(3_661_250)), "01:01:01.250");
        assert_eq!(format_timestamp(Timestamp::from_millis(0)), "00:00:00.000");
    }

    #[test]
    fn test_format_faults() {
        assert_eq!(format_faults(FaultFlags::empty()), "none");
        let mut faults = FaultFlags::empty();
        faults.insert(fault_flags::MOTOR_STALL);
        faults.insert(fault_flags::EMERGENCY_STOP);
        assert_eq!(format_faults(faults), "motor-stall,emergency-stop");
    }

    #[test]
    fn test_format_telemetry_and_health() {
        let frame = TelemetryFrame::new(Timestamp::from_millis(1000), Position::new(1.0, 2.0), MotionStatus::Slewing);
        let text = format_telemetry(&frame);
        assert!(text.starts_with("00:00:01.000"));
        assert!(text.contains("Slewing"));

        let health = LinkHealth {
            state: LinkState::Degraded,
            endpoint: None,
            reconnect_attempts: 2,
            since_last_inbound: None,
            connections: 1,
        };
        assert_eq!(
            format_health(&health),
            "link degraded to - (connections 1, retries 2, last inbound - ago)"
        );
    }
}
