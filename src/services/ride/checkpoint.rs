//! Checkpoint and resume of the current cycle
//!
//! Instants cannot outlive the process, so deadlines are stored as the time
//! left until they fire, together with the wall-clock time of the save. A
//! resumed machine takes the downtime off and re-anchors them at `now`.

use super::{RideCycle, RideStateMachine, RideTimings};
use crate::domain::types::{epoch_ms, RideState};
use anyhow::ensure;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCheckpoint {
    pub state: RideState,
    pub capacity: u32,
    pub entered: u32,
    pub exited: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boarding_remaining_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_remaining_ms: Option<u64>,
    #[serde(default)]
    pub batch_size: u32,
    /// Wall-clock time of the save in epoch ms (0 when unknown)
    #[serde(default)]
    pub saved_at_ms: u64,
}

fn remaining_ms(deadline: Option<Instant>, now: Instant) -> Option<u64> {
    deadline.map(|d| d.saturating_duration_since(now).as_millis() as u64)
}

impl CycleCheckpoint {
    /// Reject checkpoints no sequence of operations could have produced
    fn validate(&self, capacity: u32, timings: &RideTimings) -> anyhow::Result<()> {
        ensure!(
            self.capacity == capacity,
            "checkpoint capacity {} does not match configured capacity {}",
            self.capacity,
            capacity
        );
        ensure!(
            self.entered <= self.capacity,
            "checkpoint entered {} exceeds capacity {}",
            self.entered,
            self.capacity
        );
        ensure!(
            self.exited <= self.entered,
            "checkpoint exited {} exceeds entered {}",
            self.exited,
            self.entered
        );
        if let Some(ms) = self.boarding_remaining_ms {
            ensure!(
                u128::from(ms) <= timings.boarding_window.as_millis(),
                "checkpoint boarding remaining {}ms exceeds the {}ms window",
                ms,
                timings.boarding_window.as_millis()
            );
        }
        if let Some(ms) = self.ride_remaining_ms {
            ensure!(
                u128::from(ms) <= timings.ride_duration.as_millis(),
                "checkpoint ride remaining {}ms exceeds the {}ms ride",
                ms,
                timings.ride_duration.as_millis()
            );
        }

        match self.state {
            RideState::Boarding => {
                ensure!(self.exited == 0, "boarding checkpoint has exits");
                ensure!(self.entered < self.capacity, "boarding checkpoint is already full");
                ensure!(self.ride_remaining_ms.is_none(), "boarding checkpoint has a ride end");
                ensure!(
                    self.boarding_remaining_ms.is_some() == (self.entered > 0),
                    "boarding deadline must be set exactly when riders are aboard"
                );
            }
            RideState::Running => {
                ensure!(self.entered > 0, "running checkpoint has no riders");
                ensure!(self.exited == 0, "running checkpoint has exits");
                ensure!(
                    self.boarding_remaining_ms.is_none(),
                    "running checkpoint has a boarding deadline"
                );
                ensure!(self.ride_remaining_ms.is_some(), "running checkpoint has no ride end");
            }
            RideState::Unloading => {
                ensure!(self.exited < self.entered, "unloading checkpoint is already drained");
                ensure!(
                    self.boarding_remaining_ms.is_none() && self.ride_remaining_ms.is_none(),
                    "unloading checkpoint carries deadlines"
                );
            }
        }
        Ok(())
    }
}

impl RideStateMachine {
    /// Capture the current cycle relative to `now`
    pub fn checkpoint(&self, now: Instant) -> CycleCheckpoint {
        CycleCheckpoint {
            state: self.cycle.state,
            capacity: self.cycle.capacity,
            entered: self.cycle.entered,
            exited: self.cycle.exited,
            boarding_remaining_ms: remaining_ms(self.cycle.boarding_deadline, now),
            ride_remaining_ms: remaining_ms(self.cycle.ride_end_at, now),
            batch_size: self.cycle.batch_size,
            saved_at_ms: epoch_ms(),
        }
    }

    /// Rebuild a machine from a checkpoint taken before a restart.
    ///
    /// Time spent down since the save counts against the deadlines. Deadlines
    /// that already ran out resume at `now`, so the next `tick` fires them.
    pub fn resume(
        capacity: u32,
        timings: RideTimings,
        checkpoint: &CycleCheckpoint,
        now: Instant,
    ) -> anyhow::Result<Self> {
        Self::resume_at(capacity, timings, checkpoint, now, epoch_ms())
    }

    /// `resume` with an explicit wall clock (epoch ms)
    pub fn resume_at(
        capacity: u32,
        timings: RideTimings,
        checkpoint: &CycleCheckpoint,
        now: Instant,
        wall_ms: u64,
    ) -> anyhow::Result<Self> {
        checkpoint.validate(capacity, &timings)?;

        // A save stamped in the future (clock stepped back) counts as no downtime
        let downtime_ms = match checkpoint.saved_at_ms {
            0 => 0,
            saved => wall_ms.saturating_sub(saved),
        };
        let rearm = |ms: u64| now + Duration::from_millis(ms.saturating_sub(downtime_ms));

        let cycle = RideCycle {
            state: checkpoint.state,
            capacity,
            entered: checkpoint.entered,
            exited: checkpoint.exited,
            boarding_deadline: checkpoint.boarding_remaining_ms.map(rearm),
            ride_end_at: checkpoint.ride_remaining_ms.map(rearm),
            batch_size: checkpoint.batch_size,
            last_entry_at: None,
        };

        info!(
            state = %cycle.state.as_str(),
            entered = %cycle.entered,
            exited = %cycle.exited,
            remaining_seats = %cycle.remaining_seats(),
            downtime_ms = %downtime_ms,
            "ride_resumed"
        );

        Ok(Self { cycle, timings })
    }
}
