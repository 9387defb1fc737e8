//! Dummy telescope mount for rtcsim
//!
//! Serves one controller connection at a time. Commands are range checked
//! and acked; the axes move linearly toward their target and the current
//! position is streamed as telemetry.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;
use rtcproto::{
    encode, fault_flags, Ack, AckCode, Command, CommandParams, FaultFlags, FrameDecoder, Heartbeat,
    Message, MotionStatus, Position, RtcResult, TelemetryFrame, Timestamp,
};

/// Simulator settings
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub telemetry_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Degrees per second on each axis
    pub slew_rate: f64,
    /// Amplitude of the noise added to reported positions, in degrees
    pub jitter: f64,
    /// Where `Home` sends the axes
    pub home: Position,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(1),
            slew_rate: 5.0,
            jitter: 0.001,
            home: Position::new(0.0, 90.0),
        }
    }
}

pub fn valid_position(azimuth: f64, elevation: f64) -> bool {
    (0.0..360.0).contains(&azimuth) && (0.0..=90.0).contains(&elevation)
}

fn approach(current: f64, target: f64, step: f64) -> f64 {
    let delta = target - current;
    if delta.abs() <= step {
        target
    } else {
        current + step.copysign(delta)
    }
}

/// Axis and command state of the simulated mount
#[derive(Debug, Clone, PartialEq)]
pub struct MountState {
    pub position: Position,
    pub target: Option<Position>,
    /// Azimuth and elevation rates while tracking
    pub tracking: Option<(f64, f64)>,
    pub motion: MotionStatus,
    pub faults: FaultFlags,
    pub slew_rate: f64,
    home: Position,
}

impl MountState {
    pub fn new(config: &MountConfig) -> Self {
        Self {
            position: config.home,
            target: None,
            tracking: None,
            motion: MotionStatus::Idle,
            faults: FaultFlags::empty(),
            slew_rate: config.slew_rate,
            home: config.home,
        }
    }

    /// Carry out a command and return the code to ack it with
    pub fn handle(&mut self, params: &CommandParams) -> AckCode {
        let stopped = self.faults.has_flag(fault_flags::EMERGENCY_STOP);

        match params {
            CommandParams::Ping => AckCode::Accepted,
            CommandParams::Halt => {
                self.target = None;
                self.tracking = None;
                self.motion = MotionStatus::Halted;
                AckCode::Accepted
            }
            CommandParams::Move { azimuth, elevation } => {
                if !valid_position(*azimuth, *elevation) {
                    return AckCode::InvalidParameter;
                }
                if stopped {
                    return AckCode::Fault;
                }
                if self.motion == MotionStatus::Homing {
                    return AckCode::Busy;
                }
                self.target = Some(Position::new(*azimuth, *elevation));
                self.tracking = None;
                self.motion = MotionStatus::Slewing;
                AckCode::Accepted
            }
            CommandParams::Home => {
                if stopped {
                    return AckCode::Fault;
                }
                self.target = Some(self.home);
                self.tracking = None;
                self.motion = MotionStatus::Homing;
                AckCode::Accepted
            }
            CommandParams::SetTrackingRate { azimuth_rate, elevation_rate } => {
                if !azimuth_rate.is_finite() || !elevation_rate.is_finite() {
                    return AckCode::InvalidParameter;
                }
                if stopped {
                    return AckCode::Fault;
                }
                if self.target.is_some() {
                    return AckCode::Busy;
                }
                if *azimuth_rate == 0.0 && *elevation_rate == 0.0 {
                    self.tracking = None;
                    self.motion = MotionStatus::Idle;
                } else {
                    self.tracking = Some((*azimuth_rate, *elevation_rate));
                    self.motion = MotionStatus::Tracking;
                }
                AckCode::Accepted
            }
            CommandParams::SetParameter { name, value } => self.set_parameter(name, *value),
        }
    }

    fn set_parameter(&mut self, name: &str, value: f64) -> AckCode {
        if !value.is_finite() {
            return AckCode::InvalidParameter;
        }
        match name {
            "slew_rate" if value > 0.0 => {
                self.slew_rate = value;
                AckCode::Accepted
            }
            "slew_rate" => AckCode::InvalidParameter,
            "emergency_stop" => {
                if value != 0.0 {
                    self.faults.insert(fault_flags::EMERGENCY_STOP);
                    self.target = None;
                    self.tracking = None;
                    self.motion = MotionStatus::Halted;
                } else {
                    self.faults = FaultFlags(self.faults.0 & !fault_flags::EMERGENCY_STOP);
                }
                AckCode::Accepted
            }
            _ => AckCode::Unsupported,
        }
    }

    /// Move the axes forward by `dt`
    pub fn advance(&mut self, dt: Duration) {
        let seconds = dt.as_secs_f64();

        if let Some(target) = self.target {
            let step = self.slew_rate * seconds;
            self.position = Position::new(
                approach(self.position.azimuth, target.azimuth, step),
                approach(self.position.elevation, target.elevation, step),
            );
            if self.position == target {
                debug!("Mount reached {}", target);
                self.target = None;
                self.motion = MotionStatus::Idle;
            }
        } else if let Some((azimuth_rate, elevation_rate)) = self.tracking {
            let elevation = self.position.elevation + elevation_rate * seconds;
            if !(0.0..=90.0).contains(&elevation) {
                self.faults.insert(fault_flags::ELEVATION_LIMIT);
                self.tracking = None;
                self.motion = MotionStatus::Halted;
            }
            self.position = Position::new(
                (self.position.azimuth + azimuth_rate * seconds).rem_euclid(360.0),
                elevation.clamp(0.0, 90.0),
            );
        }
    }

    /// Telemetry report of the current state with `jitter` degrees of noise
    pub fn report(&self, jitter: f64) -> TelemetryFrame {
        let mut position = self.position;
        if jitter > 0.0 {
            let mut rng = rand::thread_rng();
            position.azimuth = (position.azimuth + rng.gen_range(-jitter..=jitter)).rem_euclid(360.0);
            position.elevation = (position.elevation + rng.gen_range(-jitter..=jitter)).clamp(0.0, 90.0);
        }
        TelemetryFrame::new(Timestamp::now(), position, self.motion).with_faults(self.faults)
    }
}

/// TCP server playing the mount
pub struct MountSimulator {
    listener: TcpListener,
    config: MountConfig,
    running: Arc<AtomicBool>,
}

impl MountSimulator {
    pub fn bind(addr: SocketAddr, config: MountConfig) -> RtcResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            config,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> RtcResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that keeps `run` going; clear it to stop the simulator
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serve controllers until stopped
    pub fn run(&self) -> RtcResult<()> {
        let mut state = MountState::new(&self.config);
        info!("Mount simulator listening on {}", self.local_addr()?);

        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!("Controller connected from {}", addr);
                    if let Err(e) = self.serve(stream, &mut state) {
                        warn!("Connection from {} ended: {}", addr, e);
                    } else {
                        info!("Controller {} disconnected", addr);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("Mount simulator stopped");
        Ok(())
    }

    fn serve(&self, mut stream: TcpStream, state: &mut MountState) -> RtcResult<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(10)))?;

        let mut decoder = FrameDecoder::new();
        let mut buffer = vec![0u8; 4096];
        let mut last_step = Instant::now();
        let mut last_telemetry = Instant::now();
        let mut last_heartbeat = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            match stream.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => decoder.extend(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            while let Some(message) = decoder.next_message()? {
                match message {
                    Message::Command(command) => {
                        let ack = self.execute(&command, state);
                        send(&mut stream, &Message::Ack(ack))?;
                    }
                    Message::Heartbeat(_) => {}
                    other => warn!("Unexpected {:?} frame from controller", other.kind()),
                }
            }

            let now = Instant::now();
            state.advance(now - last_step);
            last_step = now;

            if now - last_telemetry >= self.config.telemetry_interval {
                send(&mut stream, &Message::Telemetry(state.report(self.config.jitter)))?;
                last_telemetry = now;
            }
            if now - last_heartbeat >= self.config.heartbeat_interval {
                send(&mut stream, &Message::Heartbeat(Heartbeat::new()))?;
                last_heartbeat = now;
            }
        }
        Ok(())
    }

    fn execute(&self, command: &Command, state: &mut MountState) -> Ack {
        let code = state.handle(&command.params);
        if code.is_accepted() {
            info!("{} command {} accepted", command.kind(), command.correlation);
        } else {
            warn!("{} command {} refused: {}", command.kind(), command.correlation, code);
        }
        Ack::new(command.correlation, code)
    }
}

fn send(stream: &mut TcpStream, message: &Message) -> RtcResult<()> {
    let frame = encode(message)?;
    stream.write_all(&frame)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcproto::CorrelationId;

    fn state() -> MountState {
        MountState::new(&MountConfig {
            slew_rate: 10.0,
            home: Position::new(0.0, 90.0),
            ..Default::default()
        })
    }

    #[test]
    fn test_range_validation() {
        let mut state = state();
        let bad = [(360.0, 10.0), (-1.0, 10.0), (10.0, 90.5), (10.0, -0.1), (f64::NAN, 10.0)];
        for (azimuth, elevation) in bad {
            assert_eq!(
                state.handle(&CommandParams::Move { azimuth, elevation }),
                AckCode::InvalidParameter
            );
        }
        assert_eq!(
            state.handle(&CommandParams::Move { azimuth: 0.0, elevation: 90.0 }),
            AckCode::Accepted
        );
    }

    #[test]
    fn test_slew_reaches_target() {
        let mut state = state();
        state.handle(&CommandParams::Move { azimuth: 15.0, elevation: 85.0 });
        assert_eq!(state.motion, MotionStatus::Slewing);

        state.advance(Duration::from_secs(1));
        assert_eq!(state.position, Position::new(10.0, 85.0));
        assert_eq!(state.motion, MotionStatus::Slewing);

        state.advance(Duration::from_secs(1));
        assert_eq!(state.position, Position::new(15.0, 85.0));
        assert_eq!(state.motion, MotionStatus::Idle);
        assert!(state.target.is_none());
    }

    #[test]
    fn test_halt_and_home() {
        let mut state = state();
        state.handle(&CommandParams::Move { azimuth: 100.0, elevation: 10.0 });
        state.advance(Duration::from_secs(1));
        assert_eq!(state.handle(&CommandParams::Halt), AckCode::Accepted);
        assert_eq!(state.motion, MotionStatus::Halted);
        let halted_at = state.position;
        state.advance(Duration::from_secs(1));
        assert_eq!(state.position, halted_at);

        assert_eq!(state.handle(&CommandParams::Home), AckCode::Accepted);
        assert_eq!(
            state.handle(&CommandParams::Move { azimuth: 5.0, elevation: 5.0 }),
            AckCode::Busy
        );
        state.advance(Duration::from_secs(10));
        assert_eq!(state.position, Position::new(0.0, 90.0));
        assert_eq!(state.motion, MotionStatus::Idle);
    }

    #[test]
    fn test_tracking_wraps_azimuth() {
        let mut state = state();
        state.position = Position::new(359.0, 45.0);
        assert_eq!(
            state.handle(&CommandParams::SetTrackingRate { azimuth_rate: 2.0, elevation_rate: 0.0 }),
            AckCode::Accepted
        );
        state.advance(Duration::from_secs(1));
        assert_eq!(state.motion, MotionStatus::Tracking);
        assert!((state.position.azimuth - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parameters() {
        let mut state = state();
        let set = |name: &str, value| CommandParams::SetParameter { name: name.to_string(), value };

        assert_eq!(state.handle(&set("slew_rate", 2.0)), AckCode::Accepted);
        assert_eq!(state.slew_rate, 2.0);
        assert_eq!(state.handle(&set("slew_rate", -1.0)), AckCode::InvalidParameter);
        assert_eq!(state.handle(&set("focus", 1.0)), AckCode::Unsupported);

        assert_eq!(state.handle(&set("emergency_stop", 1.0)), AckCode::Accepted);
        assert_eq!(state.handle(&CommandParams::Home), AckCode::Fault);
        assert_eq!(state.handle(&set("emergency_stop", 0.0)), AckCode::Accepted);
        assert!(state.faults.is_empty());
    }

    #[test]
    fn test_serves_controller() {
        let simulator = MountSimulator::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            MountConfig {
                telemetry_interval: Duration::from_millis(20),
                ..Default::default()
            },
        )
        .unwrap();
        let addr = simulator.local_addr().unwrap();
        let running = simulator.running();
        let server = thread::spawn(move || simulator.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let command = Command::new(CorrelationId(9), CommandParams::Move { azimuth: 400.0, elevation: 0.0 });
        client.write_all(&encode(&Message::Command(command)).unwrap()).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buffer = [0u8; 1024];
        let mut ack = None;
        let mut telemetry = None;
        while ack.is_none() || telemetry.is_none() {
            let n = client.read(&mut buffer).unwrap();
            assert!(n > 0);
            decoder.extend(&buffer[..n]);
            while let Some(message) = decoder.next_message().unwrap() {
                match message {
                    Message::Ack(a) => ack = Some(a),
                    Message::Telemetry(t) => telemetry = Some(t),
                    _ => {}
                }
            }
        }

        assert_eq!(ack, Some(Ack::new(CorrelationId(9), AckCode::InvalidParameter)));
        assert_eq!(telemetry.map(|t| t.motion), Some(MotionStatus::Idle));

        running.store(false, Ordering::SeqCst);
        drop(client);
        server.join().unwrap().unwrap();
    }
}
