//! Output sinks - consumers of ride state snapshots
//!
//! Sinks run on the control loop, so `publish` must not block. Anything that
//! touches the network hands the snapshot to a worker through a channel.

use crate::domain::types::{SnapshotReason, StateSnapshot};
use tokio::sync::watch;

pub trait OutputSink: Send {
    /// Deliver a snapshot (on every transition and every heartbeat)
    fn publish(&mut self, snapshot: &StateSnapshot, reason: SnapshotReason);

    /// Controller is stopping: announce offline / drive outputs to a safe state
    fn shutdown(&mut self) {}
}

/// Sink that keeps every snapshot it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub snapshots: Vec<(StateSnapshot, SnapshotReason)>,
    pub shut_down: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&StateSnapshot> {
        self.snapshots.last().map(|(s, _)| s)
    }

    pub fn count(&self, reason: SnapshotReason) -> usize {
        self.snapshots.iter().filter(|(_, r)| *r == reason).count()
    }
}

impl OutputSink for RecordingSink {
    fn publish(&mut self, snapshot: &StateSnapshot, reason: SnapshotReason) {
        self.snapshots.push((*snapshot, reason));
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

/// Shared handle so tests can inspect a sink owned by the controller
#[derive(Debug, Clone, Default)]
pub struct SharedRecordingSink(pub std::sync::Arc<parking_lot::Mutex<RecordingSink>>);

impl SharedRecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<(StateSnapshot, SnapshotReason)> {
        self.0.lock().snapshots.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.lock().shut_down
    }
}

impl OutputSink for SharedRecordingSink {
    fn publish(&mut self, snapshot: &StateSnapshot, reason: SnapshotReason) {
        self.0.lock().publish(snapshot, reason);
    }

    fn shutdown(&mut self) {
        self.0.lock().shutdown();
    }
}

/// Sink that exposes the latest snapshot to readers on other tasks
pub struct WatchSink {
    tx: watch::Sender<Option<StateSnapshot>>,
}

impl WatchSink {
    pub fn new() -> (Self, watch::Receiver<Option<StateSnapshot>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

impl OutputSink for WatchSink {
    fn publish(&mut self, snapshot: &StateSnapshot, _reason: SnapshotReason) {
        self.tx.send_replace(Some(*snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RideState;

    #[test]
    fn test_recording_sink_counts_by_reason() {
        let mut sink = RecordingSink::new();
        let snapshot = StateSnapshot::new(RideState::Boarding, 4, 0);
        sink.publish(&snapshot, SnapshotReason::Startup);
        sink.publish(&snapshot, SnapshotReason::Heartbeat);
        sink.publish(&snapshot, SnapshotReason::Heartbeat);

        assert_eq!(sink.count(SnapshotReason::Heartbeat), 2);
        assert_eq!(sink.count(SnapshotReason::Transition), 0);
        assert_eq!(sink.last().unwrap().remaining_seats, 4);
    }

    #[test]
    fn test_watch_sink_keeps_latest() {
        let (mut sink, rx) = WatchSink::new();
        assert!(rx.borrow().is_none());

        sink.publish(&StateSnapshot::new(RideState::Boarding, 4, 0), SnapshotReason::Startup);
        sink.publish(&StateSnapshot::new(RideState::Running, 0, 10), SnapshotReason::Transition);

        let latest = rx.borrow().unwrap();
        assert_eq!(latest.state, RideState::Running);
        assert_eq!(latest.ts, 10);
    }
}
