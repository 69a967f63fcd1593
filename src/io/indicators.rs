//! Indicator lamps and seat lights
//!
//! Lamp mapping:
//! - green - boarding open
//! - yellow - ride in progress
//! - red - unloading
//!
//! Seat lights show taken seats while boarding and running, and stay lit
//! when unloading starts. The first rider out clears all of them.

use crate::domain::types::{RideState, SnapshotReason, StateSnapshot};
use crate::io::sink::OutputSink;
use tracing::info;

/// Desired state of every physical output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorFrame {
    pub green: bool,
    pub yellow: bool,
    pub red: bool,
    pub seats: Vec<bool>,
}

impl IndicatorFrame {
    /// Everything off
    pub fn neutral(capacity: u32) -> Self {
        Self { green: false, yellow: false, red: false, seats: vec![false; capacity as usize] }
    }

    pub fn from_snapshot(snapshot: &StateSnapshot, capacity: u32) -> Self {
        let taken = capacity.saturating_sub(snapshot.remaining_seats);
        Self {
            green: snapshot.boarding_open,
            yellow: snapshot.running,
            red: snapshot.unloading,
            seats: (0..capacity).map(|i| i < taken).collect(),
        }
    }

    pub fn seats_lit(&self) -> usize {
        self.seats.iter().filter(|&&on| on).count()
    }
}

/// Writes frames to the physical outputs
pub trait IndicatorDriver: Send {
    fn write(&mut self, frame: &IndicatorFrame);
}

/// Driver that reports frames in the log instead of driving pins
#[derive(Debug, Default)]
pub struct LogDriver;

impl IndicatorDriver for LogDriver {
    fn write(&mut self, frame: &IndicatorFrame) {
        info!(
            green = %frame.green,
            yellow = %frame.yellow,
            red = %frame.red,
            seats_lit = %frame.seats_lit(),
            "indicators"
        );
    }
}

/// Sink that keeps the indicators in step with the ride
pub struct IndicatorPanel<D: IndicatorDriver> {
    driver: D,
    capacity: u32,
    current: Option<IndicatorFrame>,
    last_state: Option<RideState>,
    /// An exit was seen during this unloading phase
    seats_cleared: bool,
}

impl<D: IndicatorDriver> IndicatorPanel<D> {
    pub fn new(driver: D, capacity: u32) -> Self {
        Self { driver, capacity, current: None, last_state: None, seats_cleared: false }
    }

    pub fn current(&self) -> Option<&IndicatorFrame> {
        self.current.as_ref()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Write `frame` unless it is already showing
    fn apply(&mut self, frame: IndicatorFrame) {
        if self.current.as_ref() == Some(&frame) {
            return;
        }
        self.driver.write(&frame);
        self.current = Some(frame);
    }
}

impl<D: IndicatorDriver> OutputSink for IndicatorPanel<D> {
    fn publish(&mut self, snapshot: &StateSnapshot, reason: SnapshotReason) {
        // The only unloading-to-unloading transition is an exit
        match snapshot.state {
            RideState::Unloading => {
                let exit = reason == SnapshotReason::Transition
                    && self.last_state == Some(RideState::Unloading);
                if exit {
                    self.seats_cleared = true;
                }
            }
            _ => self.seats_cleared = false,
        }
        self.last_state = Some(snapshot.state);

        let mut frame = IndicatorFrame::from_snapshot(snapshot, self.capacity);
        if self.seats_cleared {
            frame.seats.fill(false);
        }
        self.apply(frame);
    }

    fn shutdown(&mut self) {
        self.apply(IndicatorFrame::neutral(self.capacity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingDriver {
        frames: Vec<IndicatorFrame>,
    }

    impl IndicatorDriver for RecordingDriver {
        fn write(&mut self, frame: &IndicatorFrame) {
            self.frames.push(frame.clone());
        }
    }

    fn snap(state: RideState, remaining: u32) -> StateSnapshot {
        StateSnapshot::new(state, remaining, 0)
    }

    #[test]
    fn test_frame_from_boarding_snapshot() {
        let frame = IndicatorFrame::from_snapshot(&snap(RideState::Boarding, 3), 4);
        assert!(frame.green);
        assert!(!frame.yellow);
        assert!(!frame.red);
        assert_eq!(frame.seats, vec![true, false, false, false]);
    }

    #[test]
    fn test_running_and_unloading_show_taken_seats() {
        let running = IndicatorFrame::from_snapshot(&snap(RideState::Running, 1), 4);
        assert!(running.yellow);
        assert_eq!(running.seats_lit(), 3);

        let unloading = IndicatorFrame::from_snapshot(&snap(RideState::Unloading, 1), 4);
        assert!(unloading.red);
        assert_eq!(unloading.seats_lit(), 3);
    }

    #[test]
    fn test_first_exit_clears_seat_lights() {
        let mut panel = IndicatorPanel::new(RecordingDriver::default(), 4);
        panel.publish(&snap(RideState::Running, 1), SnapshotReason::Transition);

        // Ride over: red on, seats still lit
        panel.publish(&snap(RideState::Unloading, 1), SnapshotReason::Transition);
        let frame = panel.current().unwrap().clone();
        assert!(frame.red && !frame.yellow);
        assert_eq!(frame.seats_lit(), 3);

        panel.publish(&snap(RideState::Unloading, 1), SnapshotReason::Heartbeat);
        assert_eq!(panel.current().unwrap().seats_lit(), 3);

        // First rider out
        panel.publish(&snap(RideState::Unloading, 1), SnapshotReason::Transition);
        assert_eq!(panel.current().unwrap().seats_lit(), 0);
        panel.publish(&snap(RideState::Unloading, 1), SnapshotReason::Heartbeat);
        assert_eq!(panel.current().unwrap().seats_lit(), 0);

        // Last rider out: boarding reopens with every seat free
        panel.publish(&snap(RideState::Boarding, 4), SnapshotReason::Transition);
        let frame = panel.current().unwrap();
        assert!(frame.green && !frame.red);
        assert_eq!(frame.seats_lit(), 0);

        // The next ride's unloading starts lit again
        panel.publish(&snap(RideState::Running, 2), SnapshotReason::Transition);
        panel.publish(&snap(RideState::Unloading, 2), SnapshotReason::Transition);
        assert_eq!(panel.current().unwrap().seats_lit(), 2);
        assert_eq!(panel.driver().frames.len(), 6);
    }

    #[test]
    fn test_panel_skips_unchanged_frames() {
        let mut panel = IndicatorPanel::new(RecordingDriver::default(), 4);

        panel.publish(&snap(RideState::Boarding, 4), SnapshotReason::Startup);
        panel.publish(&snap(RideState::Boarding, 4), SnapshotReason::Heartbeat);
        panel.publish(&snap(RideState::Boarding, 3), SnapshotReason::Transition);

        assert_eq!(panel.driver().frames.len(), 2);
        assert_eq!(panel.current().unwrap().seats_lit(), 1);
    }

    #[test]
    fn test_shutdown_drives_neutral_frame() {
        let mut panel = IndicatorPanel::new(RecordingDriver::default(), 4);
        panel.publish(&snap(RideState::Running, 0), SnapshotReason::Transition);

        panel.shutdown();

        let last = panel.driver().frames.last().unwrap();
        assert_eq!(last, &IndicatorFrame::neutral(4));
    }
}
