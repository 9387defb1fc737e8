//! High-level controller interface for rtclib
//!
//! Composes the link session, command dispatcher and telemetry aggregator
//! behind the one API the control layer uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use rtcproto::{CommandParams, Endpoint, RtcError, RtcResult, TelemetryFrame};

use crate::config::ControllerConfig;
use crate::dispatcher::{CommandHandle, Dispatcher};
use crate::link::{LinkHealth, LinkSession, LinkState};
use crate::lock;
use crate::telemetry::{SubscriptionHandle, TelemetryAggregator, TelemetryStats};

/// Controller for one telescope mount
pub struct Controller {
    link: Arc<LinkSession>,
    dispatcher: Dispatcher,
    telemetry: Arc<TelemetryAggregator>,
    stopped: AtomicBool,
    /// Held for the whole teardown
    teardown: Mutex<()>,
}

impl Controller {
    /// Wire the components together and begin connecting to `endpoint`
    ///
    /// With `autoconnect` the connection is attempted in the background and
    /// this only fails on bad configuration. Without it the first attempt
    /// happens here and an unreachable mount is an error.
    pub fn start(endpoint: Endpoint, config: ControllerConfig) -> RtcResult<Self> {
        config.validate()?;

        let link = Arc::new(LinkSession::new(config.clone()));
        let telemetry = Arc::new(TelemetryAggregator::new(
            config.telemetry_history,
            config.telemetry_stale_after(),
        ));
        link.add_observer(telemetry.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&link), config.command_timeout())?;

        let controller = Self {
            link,
            dispatcher,
            telemetry,
            stopped: AtomicBool::new(false),
            teardown: Mutex::new(()),
        };

        if config.autoconnect {
            controller.link.start(endpoint)?;
        } else {
            controller.link.connect(endpoint)?;
        }
        info!("Controller started");
        Ok(controller)
    }

    /// Tear everything down
    ///
    /// Pending commands fail with `Shutdown`, the connection is closed and
    /// subscriptions are dropped. Idempotent; also run on drop. Concurrent
    /// callers all return only once the teardown has finished.
    pub fn stop(&self) {
        let _teardown = lock(&self.teardown);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.close();
        self.link.shutdown();
        self.telemetry.shutdown();
        info!("Controller stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Issue a command to the mount
    pub fn issue_command(&self, params: CommandParams) -> RtcResult<CommandHandle> {
        if self.is_stopped() {
            error!("{} command issued after the controller was stopped", params.kind());
            return Err(RtcError::Stopped);
        }
        self.dispatcher.issue(params)
    }

    pub fn ping(&self) -> RtcResult<CommandHandle> {
        self.issue_command(CommandParams::Ping)
    }

    /// Slew to the given azimuth and elevation, in degrees
    pub fn move_to(&self, azimuth: f64, elevation: f64) -> RtcResult<CommandHandle> {
        self.issue_command(CommandParams::Move { azimuth, elevation })
    }

    pub fn halt(&self) -> RtcResult<CommandHandle> {
        self.issue_command(CommandParams::Halt)
    }

    /// Track at the given rates, in degrees per second
    pub fn set_tracking_rate(&self, azimuth_rate: f64, elevation_rate: f64) -> RtcResult<CommandHandle> {
        self.issue_command(CommandParams::SetTrackingRate {
            azimuth_rate,
            elevation_rate,
        })
    }

    pub fn home(&self) -> RtcResult<CommandHandle> {
        self.issue_command(CommandParams::Home)
    }

    pub fn set_parameter(&self, name: impl Into<String>, value: f64) -> RtcResult<CommandHandle> {
        self.issue_command(CommandParams::SetParameter {
            name: name.into(),
            value,
        })
    }

    pub fn pending_commands(&self) -> usize {
        self.dispatcher.pending_count()
    }

    pub fn latest_telemetry(&self) -> Option<TelemetryFrame> {
        self.telemetry.latest()
    }

    pub fn recent_telemetry(&self) -> Vec<TelemetryFrame> {
        self.telemetry.recent()
    }

    pub fn telemetry_is_stale(&self) -> bool {
        self.telemetry.is_stale()
    }

    pub fn telemetry_stats(&self) -> TelemetryStats {
        self.telemetry.stats()
    }

    pub fn subscribe_telemetry<F>(&self, callback: F) -> RtcResult<SubscriptionHandle>
    where
        F: FnMut(&TelemetryFrame) + Send + 'static,
    {
        self.telemetry.subscribe(callback)
    }

    pub fn subscribe_telemetry_channel(&self) -> (SubscriptionHandle, Receiver<TelemetryFrame>) {
        self.telemetry.subscribe_channel()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.telemetry.unsubscribe(handle)
    }

    pub fn connection_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn connection_health(&self) -> LinkHealth {
        self.link.health()
    }

    pub fn connection_events(&self) -> Receiver<LinkState> {
        self.link.state_events()
    }

    pub fn wait_for_state(&self, state: LinkState, timeout: Duration) -> bool {
        self.link.wait_for_state(state, timeout)
    }

    /// Drop the current connection and reconnect
    pub fn resync(&self) {
        self.link.resync();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcproto::{Ack, AckCode, FailureReason, MotionStatus, Position, Timestamp};
    use rtcsim::ScriptedPeer;
    use std::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(3);

    fn config() -> ControllerConfig {
        ControllerConfig {
            heartbeat_interval_ms: 100,
            max_missed_heartbeats: 1000,
            command_timeout_ms: 2000,
            reconnect_delay_init_ms: 20,
            reconnect_delay_max_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_rejects_bad_config() {
        let result = Controller::start(
            Endpoint::new("127.0.0.1", 1),
            ControllerConfig {
                heartbeat_interval_ms: 5000,
                command_timeout_ms: 1000,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(RtcError::Config(_))));
    }

    #[test]
    fn test_fail_fast_without_autoconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);

        let result = Controller::start(endpoint, ControllerConfig { autoconnect: false, ..config() });
        assert!(matches!(result, Err(RtcError::Connect(_))));
    }

    #[test]
    fn test_end_to_end() {
        let peer = ScriptedPeer::bind().unwrap();
        let controller = Controller::start(peer.endpoint(), config()).unwrap();
        assert!(controller.wait_for_state(LinkState::Connected, WAIT));

        let mut conn = peer.accept(WAIT).unwrap().unwrap();
        conn.start_heartbeats(Duration::from_millis(20));
        let (_subscription, frames) = controller.subscribe_telemetry_channel();

        let handle = controller.move_to(120.0, 45.0).unwrap();
        let command = conn.expect_command(WAIT).unwrap().unwrap();
        assert_eq!(command.params, CommandParams::Move { azimuth: 120.0, elevation: 45.0 });
        conn.ack(Ack::accepted(command.correlation)).unwrap();
        handle.wait().unwrap();

        let handle = controller.set_parameter("slew_rate", 2.5).unwrap();
        let command = conn.expect_command(WAIT).unwrap().unwrap();
        conn.ack(Ack::new(command.correlation, AckCode::Unsupported)).unwrap();
        assert!(matches!(
            handle.wait(),
            Err(RtcError::Command(FailureReason::Rejected(AckCode::Unsupported)))
        ));

        let report = TelemetryFrame::new(
            Timestamp::from_millis(1_000),
            Position::new(120.0, 45.0),
            MotionStatus::Idle,
        );
        conn.telemetry(report.clone()).unwrap();
        assert_eq!(frames.recv_timeout(WAIT).unwrap(), report);
        assert_eq!(controller.latest_telemetry(), Some(report));
        assert_eq!(controller.connection_health().connections, 1);
    }

    #[test]
    fn test_non_finite_move_rejected() {
        let peer = ScriptedPeer::bind().unwrap();
        let controller = Controller::start(peer.endpoint(), ControllerConfig { autoconnect: false, ..config() }).unwrap();
        let mut conn = peer.accept(WAIT).unwrap().unwrap();
        conn.start_heartbeats(Duration::from_millis(20));

        assert!(matches!(controller.move_to(f64::NAN, 10.0), Err(RtcError::InvalidParameter(_))));
        assert!(matches!(
            controller.set_tracking_rate(f64::INFINITY, 0.0),
            Err(RtcError::InvalidParameter(_))
        ));
        assert_eq!(controller.pending_commands(), 0);
        assert!(conn.expect_command(Duration::from_millis(200)).unwrap().is_none());

        let handle = controller.ping().unwrap();
        let command = conn.expect_command(WAIT).unwrap().unwrap();
        assert_eq!(command.correlation, handle.correlation());
        assert_eq!(controller.connection_health().connections, 1);
    }

    #[test]
    fn test_stop_cancels_and_rejects() {
        let peer = ScriptedPeer::bind().unwrap();
        let controller = Controller::start(peer.endpoint(), ControllerConfig { autoconnect: false, ..config() }).unwrap();
        let mut conn = peer.accept(WAIT).unwrap().unwrap();
        conn.start_heartbeats(Duration::from_millis(20));

        let (_subscription, frames) = controller.subscribe_telemetry_channel();
        let handle = controller.home().unwrap();

        controller.stop();
        assert!(matches!(handle.wait(), Err(RtcError::Command(FailureReason::Shutdown))));
        assert!(matches!(controller.ping(), Err(RtcError::Stopped)));
        assert_eq!(controller.connection_state(), LinkState::Disconnected);
        assert!(frames.recv().is_err());
        assert!(conn.wait_closed(WAIT));

        controller.stop();
    }

    #[test]
    fn test_stop_from_another_thread() {
        let peer = ScriptedPeer::bind().unwrap();
        let controller = Arc::new(Controller::start(peer.endpoint(), config()).unwrap());
        assert!(controller.wait_for_state(LinkState::Connected, WAIT));

        let stopper = Arc::clone(&controller);
        std::thread::spawn(move || stopper.stop()).join().unwrap();
        assert!(controller.is_stopped());
        assert!(matches!(controller.halt(), Err(RtcError::Stopped)));
    }

    #[test]
    fn test_concurrent_stops_wait_for_teardown() {
        let peer = ScriptedPeer::bind().unwrap();
        let controller = Arc::new(
            Controller::start(peer.endpoint(), ControllerConfig { autoconnect: false, ..config() }).unwrap(),
        );
        let mut conn = peer.accept(WAIT).unwrap().unwrap();
        conn.start_heartbeats(Duration::from_millis(20));
        let handles = vec![controller.ping().unwrap(), controller.home().unwrap()];

        let stoppers: Vec<_> = (0..4)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let handles = handles.clone();
                std::thread::spawn(move || {
                    controller.stop();
                    handles.iter().all(|h| h.is_resolved())
                        && controller.connection_state() == LinkState::Disconnected
                })
            })
            .collect();

        for stopper in stoppers {
            assert!(stopper.join().unwrap());
        }
        assert_eq!(controller.pending_commands(), 0);
    }

    #[test]
    fn test_resync_reconnects() {
        let peer = ScriptedPeer::bind().unwrap();
        let controller = Controller::start(peer.endpoint(), config()).unwrap();
        let mut first = peer.accept(WAIT).unwrap().unwrap();
        first.start_heartbeats(Duration::from_millis(20));
        assert!(controller.wait_for_state(LinkState::Connected, WAIT));
        let events = controller.connection_events();

        controller.resync();
        let mut second = peer.accept(WAIT).unwrap().unwrap();
        second.start_heartbeats(Duration::from_millis(20));
        assert_eq!(events.recv_timeout(WAIT).unwrap(), LinkState::Disconnected);
        assert!(controller.wait_for_state(LinkState::Connected, WAIT));
    }
}
