//! Telemetry aggregation and fan-out
//!
//! Keeps the newest frame reported by the mount plus a short history, and
//! queues every applied frame onto each subscriber's channel.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rtcproto::{Message, RtcResult, TelemetryFrame};

use crate::link::{LinkObserver, LinkState};
use crate::lock;

/// Identifies one subscription for `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Counters for health displays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub applied: u64,
    /// Frames not newer than the one already held
    pub discarded: u64,
    pub subscribers: usize,
}

struct Subscriber {
    id: u64,
    sender: Sender<TelemetryFrame>,
}

#[derive(Default)]
struct AggregatorState {
    latest: Option<TelemetryFrame>,
    applied_at: Option<Instant>,
    recent: VecDeque<TelemetryFrame>,
    /// Accept the next frame whatever its timestamp
    reset_baseline: bool,
    applied: u64,
    discarded: u64,
}

pub struct TelemetryAggregator {
    history: usize,
    stale_after: Duration,
    state: Mutex<AggregatorState>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl TelemetryAggregator {
    pub fn new(history: usize, stale_after: Duration) -> Self {
        Self {
            history: history.max(1),
            stale_after,
            state: Mutex::new(AggregatorState::default()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Take in a frame from the mount
    ///
    /// Returns false if the frame is not newer than the one held.
    pub fn apply(&self, frame: TelemetryFrame) -> bool {
        let mut state = lock(&self.state);

        let newer = state.reset_baseline
            || state
                .latest
                .as_ref()
                .map_or(true, |held| frame.captured_at > held.captured_at);
        if !newer {
            state.discarded += 1;
            debug!("Discarding telemetry stamped {}ms", frame.captured_at.as_millis());
            return false;
        }

        state.reset_baseline = false;
        state.applied += 1;
        state.applied_at = Some(Instant::now());
        state.recent.push_back(frame.clone());
        while state.recent.len() > self.history {
            state.recent.pop_front();
        }

        // Enqueue while still holding the state lock so subscribers see
        // frames in the order they were applied
        self.publish(&frame);
        state.latest = Some(frame);
        true
    }

    fn publish(&self, frame: &TelemetryFrame) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber| {
            let alive = subscriber.sender.send(frame.clone()).is_ok();
            if !alive {
                debug!("Dropping telemetry subscription {}", subscriber.id);
            }
            alive
        });
    }

    /// Run `callback` on its own thread for every applied frame
    pub fn subscribe<F>(&self, mut callback: F) -> RtcResult<SubscriptionHandle>
    where
        F: FnMut(&TelemetryFrame) + Send + 'static,
    {
        let (handle, rx) = self.subscribe_channel();
        thread::Builder::new()
            .name(format!("rtc-telemetry-{}", handle.0))
            .spawn(move || {
                for frame in rx {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&frame)));
                    if outcome.is_err() {
                        warn!("Telemetry subscriber {} panicked", handle.0);
                    }
                }
            })?;
        Ok(handle)
    }

    /// Subscribe with a channel the caller drains
    pub fn subscribe_channel(&self) -> (SubscriptionHandle, Receiver<TelemetryFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = mpsc::channel();
        lock(&self.subscribers).push(Subscriber { id, sender });
        (SubscriptionHandle(id), rx)
    }

    /// Cancel a subscription; false if it was already gone
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != handle.0);
        subscribers.len() != before
    }

    pub fn latest(&self) -> Option<TelemetryFrame> {
        lock(&self.state).latest.clone()
    }

    /// Recently applied frames, oldest first
    pub fn recent(&self) -> Vec<TelemetryFrame> {
        lock(&self.state).recent.iter().cloned().collect()
    }

    pub fn is_stale(&self) -> bool {
        lock(&self.state)
            .applied_at
            .map_or(true, |at| at.elapsed() > self.stale_after)
    }

    pub fn stats(&self) -> TelemetryStats {
        let (applied, discarded) = {
            let state = lock(&self.state);
            (state.applied, state.discarded)
        };
        TelemetryStats {
            applied,
            discarded,
            subscribers: lock(&self.subscribers).len(),
        }
    }

    /// Drop every subscription, ending the delivery threads
    pub fn shutdown(&self) {
        let dropped = std::mem::take(&mut *lock(&self.subscribers));
        if !dropped.is_empty() {
            debug!("Dropped {} telemetry subscription(s)", dropped.len());
        }
    }
}

impl LinkObserver for TelemetryAggregator {
    fn on_message(&self, message: &Message) {
        if let Message::Telemetry(frame) = message {
            self.apply(frame.clone());
        }
    }

    fn on_state_change(&self, _old: LinkState, new: LinkState) {
        if new == LinkState::Disconnected {
            lock(&self.state).reset_baseline = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcproto::{MotionStatus, Position, Timestamp};
    use std::sync::Arc;

    fn frame(millis: u64) -> TelemetryFrame {
        TelemetryFrame::new(
            Timestamp::from_millis(millis),
            Position::new(millis as f64 / 10.0, 45.0),
            MotionStatus::Tracking,
        )
    }

    fn aggregator() -> TelemetryAggregator {
        TelemetryAggregator::new(8, Duration::from_secs(5))
    }

    fn stamps(frames: &[TelemetryFrame]) -> Vec<u64> {
        frames.iter().map(|f| f.captured_at.as_millis()).collect()
    }

    #[test]
    fn test_newer_frames_only() {
        let aggregator = aggregator();
        assert!(aggregator.apply(frame(10)));
        assert!(!aggregator.apply(frame(5)));
        assert!(aggregator.apply(frame(20)));

        assert_eq!(aggregator.latest(), Some(frame(20)));
        let stats = aggregator.stats();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_equal_timestamp_discarded() {
        let aggregator = aggregator();
        assert!(aggregator.apply(frame(10)));
        assert!(!aggregator.apply(frame(10)));
        assert_eq!(aggregator.stats().discarded, 1);
    }

    #[test]
    fn test_disconnect_resets_ordering() {
        let aggregator = aggregator();
        aggregator.apply(frame(100));
        aggregator.on_state_change(LinkState::Connected, LinkState::Disconnected);

        assert_eq!(aggregator.latest(), Some(frame(100)));
        assert!(aggregator.apply(frame(50)));
        assert!(!aggregator.apply(frame(40)));
        assert_eq!(aggregator.latest(), Some(frame(50)));
    }

    #[test]
    fn test_link_messages_feed_aggregator() {
        let aggregator = aggregator();
        aggregator.on_message(&Message::Telemetry(frame(3)));
        aggregator.on_message(&Message::Heartbeat(rtcproto::Heartbeat::new()));
        assert_eq!(aggregator.latest(), Some(frame(3)));
    }

    #[test]
    fn test_history_is_bounded() {
        let aggregator = TelemetryAggregator::new(3, Duration::from_secs(5));
        for millis in 1..=5 {
            aggregator.apply(frame(millis));
        }
        assert_eq!(stamps(&aggregator.recent()), vec![3, 4, 5]);
    }

    #[test]
    fn test_channel_subscription() {
        let aggregator = aggregator();
        let (_handle, rx) = aggregator.subscribe_channel();

        aggregator.apply(frame(1));
        aggregator.apply(frame(0));
        aggregator.apply(frame(2));

        let received: Vec<TelemetryFrame> = rx.try_iter().collect();
        assert_eq!(stamps(&received), vec![1, 2]);
    }

    #[test]
    fn test_callback_subscription() {
        let aggregator = aggregator();
        let (tx, rx) = mpsc::channel();
        aggregator
            .subscribe(move |frame| {
                tx.send(frame.captured_at.as_millis()).unwrap();
            })
            .unwrap();

        aggregator.apply(frame(7));
        aggregator.apply(frame(8));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 8);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let aggregator = aggregator();
        let panics = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&panics);
        aggregator
            .subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("subscriber failure");
            })
            .unwrap();

        let (tx, rx) = mpsc::channel();
        aggregator
            .subscribe(move |frame| {
                let _ = tx.send(frame.captured_at.as_millis());
            })
            .unwrap();

        for millis in 1..=3 {
            aggregator.apply(frame(millis));
        }

        let received: Vec<u64> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(received, vec![1, 2, 3]);

        let deadline = Instant::now() + Duration::from_secs(2);
        while panics.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(panics.load(Ordering::SeqCst), 3);
        assert_eq!(aggregator.stats().subscribers, 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let aggregator = aggregator();
        let (handle, rx) = aggregator.subscribe_channel();

        assert!(aggregator.unsubscribe(handle));
        assert!(!aggregator.unsubscribe(handle));

        aggregator.apply(frame(1));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let aggregator = aggregator();
        let (_handle, rx) = aggregator.subscribe_channel();
        let (_kept, _kept_rx) = aggregator.subscribe_channel();
        drop(rx);

        aggregator.apply(frame(1));
        assert_eq!(aggregator.stats().subscribers, 1);
    }

    #[test]
    fn test_staleness() {
        let aggregator = TelemetryAggregator::new(4, Duration::from_millis(50));
        assert!(aggregator.is_stale());

        aggregator.apply(frame(1));
        assert!(!aggregator.is_stale());

        thread::sleep(Duration::from_millis(80));
        assert!(aggregator.is_stale());
    }

    #[test]
    fn test_shutdown_drops_subscriptions() {
        let aggregator = aggregator();
        let (_handle, rx) = aggregator.subscribe_channel();
        aggregator.shutdown();

        assert_eq!(aggregator.stats().subscribers, 0);
        assert!(rx.recv().is_err());
    }
}
