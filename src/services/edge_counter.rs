//! Debounced near-edge counter for one ultrasonic sensor
//!
//! Turns a stream of distance samples into "one person crossed" pulses.
//! A pulse fires on the far→near edge, and only if the cooldown has elapsed
//! since the previous pulse of the same counter. Someone standing in front
//! of the sensor yields a single pulse, not one per poll.

use crate::domain::types::DistanceSample;
use std::time::{Duration, Instant};
use tracing::trace;

pub struct DebouncedEdgeCounter {
    near_threshold_cm: f64,
    cooldown: Duration,
    is_near: bool,
    /// Time of the last emitted pulse, `None` until the first one
    last_count_at: Option<Instant>,
}

impl DebouncedEdgeCounter {
    pub fn new(near_threshold_cm: f64, cooldown: Duration) -> Self {
        Self { near_threshold_cm, cooldown, is_near: false, last_count_at: None }
    }

    /// Feed one sample. Returns 1 when a new person is detected, else 0.
    ///
    /// A miss leaves the edge state untouched.
    pub fn poll(&mut self, sample: &DistanceSample) -> u32 {
        let Some(distance_cm) = sample.value_cm else {
            trace!("edge_counter_sample_missed");
            return 0;
        };

        let is_near_now = distance_cm <= self.near_threshold_cm;
        let mut count = 0;

        if is_near_now && !self.is_near && self.cooldown_elapsed(sample.at) {
            count = 1;
            self.last_count_at = Some(sample.at);
        }

        self.is_near = is_near_now;
        count
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_count_at {
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
            None => true,
        }
    }

    pub fn is_near(&self) -> bool {
        self.is_near
    }

    pub fn last_count_at(&self) -> Option<Instant> {
        self.last_count_at
    }
}
