//! Shared types for the ride controller

use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Get current epoch time in milliseconds
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Which side of the ride a distance sensor watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorRole {
    Entrance,
    Exit,
}

impl SensorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorRole::Entrance => "entrance",
            SensorRole::Exit => "exit",
        }
    }
}

/// One distance measurement from an ultrasonic probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceSample {
    /// Distance in centimeters, `None` when the probe timed out
    pub value_cm: Option<f64>,
    /// Monotonic time the sample was taken
    pub at: Instant,
}

impl DistanceSample {
    /// A sample carrying a measurement.
    ///
    /// Negative or non-finite values cannot come from a working probe and are
    /// stored as a miss.
    pub fn reading(cm: f64, at: Instant) -> Self {
        let value_cm = if cm.is_finite() && cm >= 0.0 { Some(cm) } else { None };
        Self { value_cm, at }
    }

    /// A sample for a probe read that produced nothing
    pub fn miss(at: Instant) -> Self {
        Self { value_cm: None, at }
    }

    pub fn is_miss(&self) -> bool {
        self.value_cm.is_none()
    }
}

/// Phase of the boarding/run/unload cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideState {
    /// Boarding open, entrance sensor counts riders
    Boarding,
    /// Ride in progress, both sensors disregarded
    Running,
    /// Ride finished, exit sensor counts riders leaving
    Unloading,
}

impl RideState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideState::Boarding => "boarding",
            RideState::Running => "running",
            RideState::Unloading => "unloading",
        }
    }
}

/// Why a snapshot was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// First snapshot after process start
    Startup,
    /// The ride cycle changed
    Transition,
    /// Periodic refresh with no change
    Heartbeat,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotReason::Startup => "startup",
            SnapshotReason::Transition => "transition",
            SnapshotReason::Heartbeat => "heartbeat",
        }
    }
}

/// Immutable point-in-time summary of the ride, handed to every output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub state: RideState,
    pub boarding_open: bool,
    pub remaining_seats: u32,
    pub running: bool,
    pub unloading: bool,
    /// Epoch milliseconds at emission
    pub ts: u64,
}

impl StateSnapshot {
    pub fn new(state: RideState, remaining_seats: u32, ts: u64) -> Self {
        Self {
            state,
            boarding_open: state == RideState::Boarding,
            remaining_seats,
            running: state == RideState::Running,
            unloading: state == RideState::Unloading,
            ts,
        }
    }
}
