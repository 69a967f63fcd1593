//! Ride admission state machine
//!
//! Owns seat accounting and the BOARDING → RUNNING → UNLOADING → BOARDING
//! cycle. Entry and exit pulses arrive from two independent edge counters;
//! elapsed-time transitions are evaluated by `tick`. Every operation takes the
//! current monotonic instant explicitly and never fails: calls that make no
//! sense in the current state are no-ops.
//!
//! Invariants held after every operation:
//! - `entered <= capacity`
//! - `exited <= entered`
//! - `boarding_deadline` is only set in BOARDING, `ride_end_at` only in RUNNING

mod checkpoint;
#[cfg(test)]
mod tests;

pub use checkpoint::CycleCheckpoint;

use crate::domain::types::{epoch_ms, RideState, StateSnapshot};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Time budgets of one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RideTimings {
    /// Boarding closes this long after the most recent entry
    pub boarding_window: Duration,
    /// How long the ride runs once started
    pub ride_duration: Duration,
    /// Entries closer together than this belong to the same batch (diagnostic)
    pub group_gap: Duration,
}

impl Default for RideTimings {
    fn default() -> Self {
        Self {
            boarding_window: Duration::from_secs(30),
            ride_duration: Duration::from_secs(30),
            group_gap: Duration::from_secs(5),
        }
    }
}

/// What closed boarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideStartCause {
    /// Last seat taken
    Full,
    /// Boarding window elapsed with at least one rider aboard
    BoardingWindow,
}

impl RideStartCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStartCause::Full => "full",
            RideStartCause::BoardingWindow => "boarding_window",
        }
    }
}

/// Mutable state of the current boarding/run/unload cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RideCycle {
    pub state: RideState,
    pub capacity: u32,
    pub entered: u32,
    pub exited: u32,
    pub boarding_deadline: Option<Instant>,
    pub ride_end_at: Option<Instant>,
    /// Size of the current group of closely spaced entries (diagnostic only)
    pub batch_size: u32,
    /// Time of the most recent accepted entry (diagnostic only)
    pub last_entry_at: Option<Instant>,
}

impl RideCycle {
    fn fresh(capacity: u32) -> Self {
        Self {
            state: RideState::Boarding,
            capacity,
            entered: 0,
            exited: 0,
            boarding_deadline: None,
            ride_end_at: None,
            batch_size: 0,
            last_entry_at: None,
        }
    }

    pub fn remaining_seats(&self) -> u32 {
        self.capacity.saturating_sub(self.entered)
    }
}

pub struct RideStateMachine {
    cycle: RideCycle,
    timings: RideTimings,
}

impl RideStateMachine {
    /// Create a machine in a fresh BOARDING cycle.
    ///
    /// `capacity` is validated by config loading and must be positive.
    pub fn new(capacity: u32, timings: RideTimings) -> Self {
        debug_assert!(capacity > 0, "ride capacity must be positive");
        info!(
            capacity = %capacity,
            boarding_window_ms = %timings.boarding_window.as_millis(),
            ride_duration_ms = %timings.ride_duration.as_millis(),
            "ride_initialized"
        );
        Self { cycle: RideCycle::fresh(capacity), timings }
    }

    /// A person passed the entrance sensor
    pub fn on_entry(&mut self, now: Instant) -> Option<StateSnapshot> {
        if self.cycle.state != RideState::Boarding {
            debug!(state = %self.cycle.state.as_str(), "ride_entry_ignored");
            return None;
        }

        if self.cycle.remaining_seats() == 0 {
            info!(capacity = %self.cycle.capacity, "ride_full_entry_dropped");
            return None;
        }

        self.cycle.entered += 1;
        self.update_batch(now);
        self.cycle.boarding_deadline = Some(now + self.timings.boarding_window);

        let remaining = self.cycle.remaining_seats();
        info!(
            entered = %self.cycle.entered,
            remaining_seats = %remaining,
            batch_size = %self.cycle.batch_size,
            "ride_entry"
        );

        if remaining == 0 {
            self.start_ride(now, RideStartCause::Full);
        }

        Some(self.snapshot())
    }

    /// A person passed the exit sensor
    pub fn on_exit(&mut self, _now: Instant) -> Option<StateSnapshot> {
        if self.cycle.state != RideState::Unloading {
            debug!(state = %self.cycle.state.as_str(), "ride_exit_ignored");
            return None;
        }

        self.cycle.exited += 1;
        info!(exited = %self.cycle.exited, entered = %self.cycle.entered, "ride_exit");

        if self.cycle.exited >= self.cycle.entered {
            self.reset_cycle();
        }

        Some(self.snapshot())
    }

    /// Evaluate elapsed-time transitions
    pub fn tick(&mut self, now: Instant) -> Option<StateSnapshot> {
        match self.cycle.state {
            RideState::Boarding => {
                // An empty ride waits for its first rider before any deadline applies
                let expired = self.cycle.entered > 0
                    && self.cycle.boarding_deadline.is_some_and(|deadline| now >= deadline);
                if !expired {
                    return None;
                }
                self.start_ride(now, RideStartCause::BoardingWindow);
            }
            RideState::Running => {
                if !self.cycle.ride_end_at.is_some_and(|end| now >= end) {
                    return None;
                }
                self.cycle.state = RideState::Unloading;
                self.cycle.ride_end_at = None;
                info!(riders = %self.cycle.entered, "ride_finished");
            }
            RideState::Unloading => return None,
        }

        Some(self.snapshot())
    }

    /// Current state as an immutable snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.cycle.state, self.cycle.remaining_seats(), epoch_ms())
    }

    pub fn cycle(&self) -> &RideCycle {
        &self.cycle
    }

    pub fn state(&self) -> RideState {
        self.cycle.state
    }

    pub fn remaining_seats(&self) -> u32 {
        self.cycle.remaining_seats()
    }

    pub fn capacity(&self) -> u32 {
        self.cycle.capacity
    }

    pub fn timings(&self) -> &RideTimings {
        &self.timings
    }

    /// A boarding window or ride timer is counting down
    pub fn deadline_armed(&self) -> bool {
        self.cycle.boarding_deadline.is_some() || self.cycle.ride_end_at.is_some()
    }

    fn update_batch(&mut self, now: Instant) {
        let within_gap = self
            .cycle
            .last_entry_at
            .is_some_and(|last| now.saturating_duration_since(last) <= self.timings.group_gap);

        if self.cycle.batch_size > 0 && within_gap {
            self.cycle.batch_size += 1;
        } else {
            if self.cycle.batch_size > 0 {
                info!(batch_size = %self.cycle.batch_size, "batch_finalized");
            }
            self.cycle.batch_size = 1;
        }
        self.cycle.last_entry_at = Some(now);
    }

    fn start_ride(&mut self, now: Instant, cause: RideStartCause) {
        self.cycle.state = RideState::Running;
        self.cycle.ride_end_at = Some(now + self.timings.ride_duration);
        self.cycle.boarding_deadline = None;
        self.cycle.batch_size = 0;
        info!(
            cause = %cause.as_str(),
            riders = %self.cycle.entered,
            remaining_seats = %self.cycle.remaining_seats(),
            ride_duration_ms = %self.timings.ride_duration.as_millis(),
            "ride_started"
        );
    }

    fn reset_cycle(&mut self) {
        self.cycle = RideCycle::fresh(self.cycle.capacity);
        info!(remaining_seats = %self.cycle.capacity, "ride_cycle_reset");
    }

    /// Last cause that started a ride, inferred from the cycle
    ///
    /// Only meaningful right after a transition into RUNNING.
    pub fn start_cause(&self) -> Option<RideStartCause> {
        if self.cycle.state != RideState::Running {
            return None;
        }
        if self.cycle.remaining_seats() == 0 {
            Some(RideStartCause::Full)
        } else {
            Some(RideStartCause::BoardingWindow)
        }
    }
}
