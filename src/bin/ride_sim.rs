//! Ride Simulation - synthetic riders on a virtual clock
//!
//! Feeds generated distance readings through the real control loop (edge
//! counters, state machine, sinks) without sensors or wall-clock waiting.
//! Every snapshot is printed to stdout as one JSON line; logs go to stderr.
//!
//! Rider model:
//! - riders walk up to the entrance only while boarding is open, with a
//!   pseudo-random gap between them
//! - riders leave through the exit one by one while unloading
//! - a fraction of readings are dropped to mimic missing echoes
//!
//! Usage:
//!   cargo run --bin ride-sim -- --duration-secs 600 --seed 7

use async_trait::async_trait;
use clap::Parser;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use ride_controller::domain::types::{RideState, SnapshotReason, StateSnapshot};
use ride_controller::infra::{Config, Metrics};
use ride_controller::io::{DistanceProbe, OutputSink};
use ride_controller::services::RideController;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

/// Reading while nobody stands under a sensor
const CLEAR_CM: f64 = 180.0;
/// Reading while a rider passes under a sensor
const PERSON_CM: f64 = 35.0;
/// How long one rider stays under a sensor
const PASSAGE: Duration = Duration::from_millis(400);

// ============================================================================
// CLI Args
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "ride-sim")]
#[command(about = "Drive the ride controller with synthetic riders")]
struct Args {
    /// Config file path (defaults are used when the file does not exist)
    #[arg(short, long, default_value = "config/sim.toml")]
    config: String,

    /// Simulated time to run
    #[arg(long, default_value = "300")]
    duration_secs: u64,

    /// Seed for rider arrivals and sensor misses
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Mean gap between riders walking up to the entrance
    #[arg(long, default_value = "4000")]
    mean_gap_ms: u64,

    /// Gap between riders leaving through the exit
    #[arg(long, default_value = "1500")]
    exit_gap_ms: u64,

    /// Fraction of readings that come back without an echo
    #[arg(long, default_value = "0.05")]
    miss_rate: f64,

    /// Also print heartbeat snapshots
    #[arg(long)]
    heartbeats: bool,
}

// ============================================================================
// Simulation pieces
// ============================================================================

/// Probe fed by the simulation before every step
#[derive(Clone, Default)]
struct SimSensor(Arc<Mutex<VecDeque<Option<f64>>>>);

impl SimSensor {
    fn feed(&self, reading: Option<f64>) {
        self.0.lock().push_back(reading);
    }
}

#[async_trait]
impl DistanceProbe for SimSensor {
    async fn read_cm(&mut self) -> Option<f64> {
        self.0.lock().pop_front().flatten()
    }
}

/// One sensor's view of riders walking past it
struct Lane {
    sensor: SimSensor,
    passing_until: Option<Instant>,
    next_at: Instant,
}

impl Lane {
    fn new(sensor: SimSensor, start: Instant) -> Self {
        Self { sensor, passing_until: None, next_at: start }
    }

    /// Start a passage if one is allowed and due, then feed this step's reading
    fn advance(&mut self, now: Instant, allowed: bool, gap: Duration, rng: &mut ChaCha8Rng, miss_rate: f64) {
        if self.passing_until.is_some_and(|until| now >= until) {
            self.passing_until = None;
        }
        if self.passing_until.is_none() && allowed && now >= self.next_at {
            self.passing_until = Some(now + PASSAGE);
            self.next_at = now + PASSAGE + gap;
        }

        let reading = if rng.gen_bool(miss_rate) {
            None
        } else if self.passing_until.is_some() {
            Some(PERSON_CM)
        } else {
            Some(CLEAR_CM)
        };
        self.sensor.feed(reading);
    }
}

#[derive(Serialize)]
struct SnapshotLine<'a> {
    sim_ms: u64,
    reason: &'a str,
    #[serde(flatten)]
    snapshot: &'a StateSnapshot,
}

/// Prints snapshots as JSON lines, stamped with simulated time
struct JsonLinesSink {
    clock: Arc<Mutex<u64>>,
    heartbeats: bool,
}

impl OutputSink for JsonLinesSink {
    fn publish(&mut self, snapshot: &StateSnapshot, reason: SnapshotReason) {
        if reason == SnapshotReason::Heartbeat && !self.heartbeats {
            return;
        }
        let line = SnapshotLine { sim_ms: *self.clock.lock(), reason: reason.as_str(), snapshot };
        match serde_json::to_string(&line) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("snapshot encode failed: {e}"),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.miss_rate),
        "--miss-rate must be between 0 and 1, got {}",
        args.miss_rate
    );
    let config = Config::load_from_path(&args.config)?;
    let metrics = Arc::new(Metrics::new());

    let entrance = SimSensor::default();
    let exit = SimSensor::default();
    let clock = Arc::new(Mutex::new(0u64));

    let mut controller =
        RideController::new(&config, entrance.clone(), exit.clone(), metrics.clone());
    controller.add_sink(Box::new(JsonLinesSink { clock: clock.clone(), heartbeats: args.heartbeats }));

    // Same seed, same riders
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let start = Instant::now();
    let mut entrance_lane = Lane::new(entrance, start);
    let mut exit_lane = Lane::new(exit, start);
    let step = config.sample_period();
    let total_steps = Duration::from_secs(args.duration_secs).as_millis() / step.as_millis().max(1);

    controller.start(start);

    for i in 0..total_steps {
        let now = start + step * i as u32;
        *clock.lock() = (now - start).as_millis() as u64;

        let state = controller.machine().state();
        let mean_gap = args.mean_gap_ms as f64;
        // Exponential-ish spread around the mean gap
        let entry_gap = Duration::from_millis((-mean_gap * (1.0 - rng.gen::<f64>()).ln()) as u64);
        entrance_lane.advance(now, state == RideState::Boarding, entry_gap, &mut rng, args.miss_rate);
        exit_lane.advance(
            now,
            state == RideState::Unloading,
            Duration::from_millis(args.exit_gap_ms),
            &mut rng,
            args.miss_rate,
        );

        controller.step(now).await;
    }

    let summary = metrics.summary();
    eprintln!(
        "simulated {}s: entries={} dropped_full={} exits={} rides_full={} rides_window={} cycles={}",
        args.duration_secs,
        summary.entries_accepted,
        summary.entries_dropped_full,
        summary.exits_accepted,
        summary.rides_started_full,
        summary.rides_started_window,
        summary.cycles_completed
    );
    Ok(())
}
