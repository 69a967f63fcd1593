//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the control loop never waits on the reporter or the
//! Prometheus endpoint. Counters are monotonic; the loop latency histogram is
//! reset by `report()` and only read by `summary()`.
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::{RideState, SensorRole, SnapshotReason};
use crate::services::ride::RideStartCause;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Ride state values for the Prometheus gauge
pub const RIDE_STATE_BOARDING: u64 = 0;
pub const RIDE_STATE_RUNNING: u64 = 1;
pub const RIDE_STATE_UNLOADING: u64 = 2;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Entrance pulses from the edge counter (monotonic)
    entries_detected: AtomicU64,
    /// Entrance pulses that took a seat (monotonic)
    entries_accepted: AtomicU64,
    /// Entrance pulses dropped because the ride was full (monotonic)
    entries_dropped_full: AtomicU64,
    /// Entrance pulses ignored outside boarding (monotonic)
    entries_ignored: AtomicU64,
    /// Exit pulses from the edge counter (monotonic)
    exits_detected: AtomicU64,
    /// Exit pulses counted while unloading (monotonic)
    exits_accepted: AtomicU64,
    /// Exit pulses ignored outside unloading (monotonic)
    exits_ignored: AtomicU64,
    /// Entrance probe reads without a distance (monotonic)
    entrance_misses: AtomicU64,
    /// Exit probe reads without a distance (monotonic)
    exit_misses: AtomicU64,
    /// Rides started because the last seat was taken (monotonic)
    rides_started_full: AtomicU64,
    /// Rides started by the boarding window (monotonic)
    rides_started_window: AtomicU64,
    /// Cycles that drained back to boarding (monotonic)
    cycles_completed: AtomicU64,
    /// Snapshots emitted on transitions (monotonic)
    snapshots_transition: AtomicU64,
    /// Snapshots emitted by the heartbeat (monotonic)
    snapshots_heartbeat: AtomicU64,
    /// Egress messages dropped due to a full channel (monotonic)
    egress_dropped: AtomicU64,
    /// Current ride state (0=boarding, 1=running, 2=unloading)
    ride_state: AtomicU64,
    /// Current free seats
    remaining_seats: AtomicU64,
    /// Loop steps since last report (reset on report)
    steps_since_report: AtomicU64,
    /// Sum of step latencies in microseconds (reset on report)
    step_latency_sum_us: AtomicU64,
    /// Max step latency in microseconds (reset on report)
    step_latency_max_us: AtomicU64,
    /// Step latency histogram buckets (reset on report)
    step_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            entries_detected: AtomicU64::new(0),
            entries_accepted: AtomicU64::new(0),
            entries_dropped_full: AtomicU64::new(0),
            entries_ignored: AtomicU64::new(0),
            exits_detected: AtomicU64::new(0),
            exits_accepted: AtomicU64::new(0),
            exits_ignored: AtomicU64::new(0),
            entrance_misses: AtomicU64::new(0),
            exit_misses: AtomicU64::new(0),
            rides_started_full: AtomicU64::new(0),
            rides_started_window: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            snapshots_transition: AtomicU64::new(0),
            snapshots_heartbeat: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            ride_state: AtomicU64::new(RIDE_STATE_BOARDING),
            remaining_seats: AtomicU64::new(0),
            steps_since_report: AtomicU64::new(0),
            step_latency_sum_us: AtomicU64::new(0),
            step_latency_max_us: AtomicU64::new(0),
            step_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sensor_miss(&self, role: SensorRole) {
        match role {
            SensorRole::Entrance => self.entrance_misses.fetch_add(1, Ordering::Relaxed),
            SensorRole::Exit => self.exit_misses.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_entry_detected(&self) {
        self.entries_detected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry_accepted(&self) {
        self.entries_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry_dropped_full(&self) {
        self.entries_dropped_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry_ignored(&self) {
        self.entries_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_detected(&self) {
        self.exits_detected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_accepted(&self) {
        self.exits_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_ignored(&self) {
        self.exits_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ride_started(&self, cause: RideStartCause) {
        match cause {
            RideStartCause::Full => self.rides_started_full.fetch_add(1, Ordering::Relaxed),
            RideStartCause::BoardingWindow => {
                self.rides_started_window.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    #[inline]
    pub fn record_cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot(&self, reason: SnapshotReason) {
        match reason {
            SnapshotReason::Heartbeat => self.snapshots_heartbeat.fetch_add(1, Ordering::Relaxed),
            SnapshotReason::Startup | SnapshotReason::Transition => {
                self.snapshots_transition.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the current ride gauges
    #[inline]
    pub fn set_ride_state(&self, state: RideState, remaining_seats: u32) {
        let value = match state {
            RideState::Boarding => RIDE_STATE_BOARDING,
            RideState::Running => RIDE_STATE_RUNNING,
            RideState::Unloading => RIDE_STATE_UNLOADING,
        };
        self.ride_state.store(value, Ordering::Relaxed);
        self.remaining_seats.store(remaining_seats as u64, Ordering::Relaxed);
    }

    /// Record one control loop step (lock-free)
    #[inline]
    pub fn record_step(&self, latency_us: u64) {
        self.steps_since_report.fetch_add(1, Ordering::Relaxed);
        self.step_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.step_latency_max_us, latency_us);
        self.step_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn egress_dropped(&self) -> u64 {
        self.egress_dropped.load(Ordering::Relaxed)
    }

    pub fn entries_accepted(&self) -> u64 {
        self.entries_accepted.load(Ordering::Relaxed)
    }

    pub fn exits_accepted(&self) -> u64 {
        self.exits_accepted.load(Ordering::Relaxed)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Read everything without resetting the periodic counters
    pub fn summary(&self) -> MetricsSummary {
        let buckets = load_buckets(&self.step_latency_buckets);
        let steps = self.steps_since_report.load(Ordering::Relaxed);
        let sum = self.step_latency_sum_us.load(Ordering::Relaxed);
        let max = self.step_latency_max_us.load(Ordering::Relaxed);
        self.build_summary(buckets, steps, sum, max, 0.0)
    }

    /// Read everything and reset the periodic counters
    pub fn report(&self) -> MetricsSummary {
        let steps = self.steps_since_report.swap(0, Ordering::Relaxed);
        let sum = self.step_latency_sum_us.swap(0, Ordering::Relaxed);
        let max = self.step_latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.step_latency_buckets);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let steps_per_sec = if elapsed.as_secs_f64() > 0.0 {
            steps as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.build_summary(buckets, steps, sum, max, steps_per_sec)
    }

    fn build_summary(
        &self,
        step_lat_buckets: [u64; METRICS_NUM_BUCKETS],
        steps: u64,
        latency_sum_us: u64,
        latency_max_us: u64,
        steps_per_sec: f64,
    ) -> MetricsSummary {
        MetricsSummary {
            entries_detected: self.entries_detected.load(Ordering::Relaxed),
            entries_accepted: self.entries_accepted.load(Ordering::Relaxed),
            entries_dropped_full: self.entries_dropped_full.load(Ordering::Relaxed),
            entries_ignored: self.entries_ignored.load(Ordering::Relaxed),
            exits_detected: self.exits_detected.load(Ordering::Relaxed),
            exits_accepted: self.exits_accepted.load(Ordering::Relaxed),
            exits_ignored: self.exits_ignored.load(Ordering::Relaxed),
            entrance_misses: self.entrance_misses.load(Ordering::Relaxed),
            exit_misses: self.exit_misses.load(Ordering::Relaxed),
            rides_started_full: self.rides_started_full.load(Ordering::Relaxed),
            rides_started_window: self.rides_started_window.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            snapshots_transition: self.snapshots_transition.load(Ordering::Relaxed),
            snapshots_heartbeat: self.snapshots_heartbeat.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            ride_state: self.ride_state.load(Ordering::Relaxed),
            remaining_seats: self.remaining_seats.load(Ordering::Relaxed),
            steps,
            steps_per_sec,
            step_lat_avg_us: if steps > 0 { latency_sum_us / steps } else { 0 },
            step_lat_max_us: latency_max_us,
            step_lat_p99_us: percentile_from_buckets(&step_lat_buckets, 0.99),
            step_lat_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub entries_detected: u64,
    pub entries_accepted: u64,
    pub entries_dropped_full: u64,
    pub entries_ignored: u64,
    pub exits_detected: u64,
    pub exits_accepted: u64,
    pub exits_ignored: u64,
    pub entrance_misses: u64,
    pub exit_misses: u64,
    pub rides_started_full: u64,
    pub rides_started_window: u64,
    pub cycles_completed: u64,
    pub snapshots_transition: u64,
    pub snapshots_heartbeat: u64,
    pub egress_dropped: u64,
    pub ride_state: u64,
    pub remaining_seats: u64,
    pub steps: u64,
    pub steps_per_sec: f64,
    pub step_lat_avg_us: u64,
    pub step_lat_max_us: u64,
    pub step_lat_p99_us: u64,
    pub step_lat_buckets: [u64; METRICS_NUM_BUCKETS],
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            entries = %self.entries_accepted,
            entries_dropped_full = %self.entries_dropped_full,
            exits = %self.exits_accepted,
            rides_full = %self.rides_started_full,
            rides_window = %self.rides_started_window,
            cycles = %self.cycles_completed,
            entrance_misses = %self.entrance_misses,
            exit_misses = %self.exit_misses,
            steps_per_sec = format!("{:.1}", self.steps_per_sec),
            step_avg_us = %self.step_lat_avg_us,
            step_max_us = %self.step_lat_max_us,
            step_p99_us = %self.step_lat_p99_us,
            egress_dropped = %self.egress_dropped,
            "metrics"
        );
    }
}
