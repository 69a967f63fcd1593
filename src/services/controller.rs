//! Ride control loop
//!
//! One task owns the edge counters, the state machine and every sink. Each
//! step polls both probes concurrently, feeds entrance counts then exit counts
//! into the state machine, evaluates elapsed-time transitions and emits a
//! heartbeat when one is due. Nothing here is shared, so nothing here locks.
//!
//! The checkpoint is rewritten on every change and, while a timer is
//! counting down, on every heartbeat.

use crate::domain::types::{DistanceSample, RideState, SensorRole, SnapshotReason, StateSnapshot};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::checkpoint::CheckpointStore;
use crate::io::probe::DistanceProbe;
use crate::io::sink::OutputSink;
use crate::services::edge_counter::DebouncedEdgeCounter;
use crate::services::ride::RideStateMachine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Take one bounded reading from a probe
async fn read_sample<P: DistanceProbe>(probe: &mut P, limit: Duration, now: Instant) -> DistanceSample {
    match timeout(limit, probe.read_cm()).await {
        Ok(Some(cm)) => DistanceSample::reading(cm, now),
        Ok(None) => DistanceSample::miss(now),
        Err(_) => {
            trace!(timeout_ms = %limit.as_millis(), "probe_read_timeout");
            DistanceSample::miss(now)
        }
    }
}

pub struct RideController<E: DistanceProbe, X: DistanceProbe> {
    entrance: E,
    exit: X,
    entrance_counter: DebouncedEdgeCounter,
    exit_counter: DebouncedEdgeCounter,
    machine: RideStateMachine,
    sinks: Vec<Box<dyn OutputSink>>,
    metrics: Arc<Metrics>,
    checkpoint_store: Option<CheckpointStore>,
    read_timeout: Duration,
    sample_period: Duration,
    heartbeat_period: Duration,
    last_heartbeat_at: Option<Instant>,
}

impl<E: DistanceProbe, X: DistanceProbe> RideController<E, X> {
    /// Controller with a fresh BOARDING cycle
    pub fn new(config: &Config, entrance: E, exit: X, metrics: Arc<Metrics>) -> Self {
        let machine = RideStateMachine::new(config.capacity(), config.ride_timings());
        Self::with_machine(config, entrance, exit, machine, metrics)
    }

    /// Controller around an existing (e.g. resumed) state machine
    pub fn with_machine(
        config: &Config,
        entrance: E,
        exit: X,
        machine: RideStateMachine,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            entrance,
            exit,
            entrance_counter: DebouncedEdgeCounter::new(config.near_threshold_cm(), config.cooldown()),
            exit_counter: DebouncedEdgeCounter::new(config.near_threshold_cm(), config.cooldown()),
            machine,
            sinks: Vec::new(),
            metrics,
            checkpoint_store: None,
            read_timeout: config.read_timeout(),
            sample_period: config.sample_period(),
            heartbeat_period: config.heartbeat_period(),
            last_heartbeat_at: None,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sinks.push(sink);
    }

    /// Persist the cycle after every change and on heartbeats while a timer runs
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn machine(&self) -> &RideStateMachine {
        &self.machine
    }

    /// Announce the current state and start the heartbeat schedule
    pub fn start(&mut self, now: Instant) {
        let snapshot = self.machine.snapshot();
        info!(
            state = %snapshot.state.as_str(),
            remaining_seats = %snapshot.remaining_seats,
            sinks = %self.sinks.len(),
            "ride_controller_started"
        );
        self.emit(&snapshot, SnapshotReason::Startup);
        self.last_heartbeat_at = Some(now);
        self.save_checkpoint(now);
    }

    /// One control loop iteration
    pub async fn step(&mut self, now: Instant) {
        // Both reads share one timeout budget
        let (entrance, exit) = tokio::join!(
            read_sample(&mut self.entrance, self.read_timeout, now),
            read_sample(&mut self.exit, self.read_timeout, now)
        );
        if entrance.is_miss() {
            self.metrics.record_sensor_miss(SensorRole::Entrance);
        }
        if exit.is_miss() {
            self.metrics.record_sensor_miss(SensorRole::Exit);
        }

        let entries = self.entrance_counter.poll(&entrance);
        let exits = self.exit_counter.poll(&exit);

        let mut changed = false;
        for _ in 0..entries {
            changed |= self.handle_entry(now);
        }
        for _ in 0..exits {
            changed |= self.handle_exit(now);
        }

        if let Some(snapshot) = self.machine.tick(now) {
            if let Some(cause) = self.machine.start_cause() {
                self.metrics.record_ride_started(cause);
            }
            self.emit(&snapshot, SnapshotReason::Transition);
            changed = true;
        }

        self.metrics.set_ride_state(self.machine.state(), self.machine.remaining_seats());

        if changed {
            self.save_checkpoint(now);
        }

        let heartbeat_due = match self.last_heartbeat_at {
            Some(last) => now.saturating_duration_since(last) >= self.heartbeat_period,
            None => true,
        };
        if heartbeat_due {
            let snapshot = self.machine.snapshot();
            self.emit(&snapshot, SnapshotReason::Heartbeat);
            self.last_heartbeat_at = Some(now);
            if !changed && self.machine.deadline_armed() {
                self.save_checkpoint(now);
            }
        }
    }

    fn handle_entry(&mut self, now: Instant) -> bool {
        self.metrics.record_entry_detected();
        let before = self.machine.state();

        match self.machine.on_entry(now) {
            Some(snapshot) => {
                self.metrics.record_entry_accepted();
                if snapshot.state == RideState::Running {
                    if let Some(cause) = self.machine.start_cause() {
                        self.metrics.record_ride_started(cause);
                    }
                }
                self.emit(&snapshot, SnapshotReason::Transition);
                true
            }
            None if before == RideState::Boarding => {
                self.metrics.record_entry_dropped_full();
                false
            }
            None => {
                self.metrics.record_entry_ignored();
                false
            }
        }
    }

    fn handle_exit(&mut self, now: Instant) -> bool {
        self.metrics.record_exit_detected();

        match self.machine.on_exit(now) {
            Some(snapshot) => {
                self.metrics.record_exit_accepted();
                if snapshot.state == RideState::Boarding {
                    self.metrics.record_cycle_completed();
                }
                self.emit(&snapshot, SnapshotReason::Transition);
                true
            }
            None => {
                self.metrics.record_exit_ignored();
                false
            }
        }
    }

    fn emit(&mut self, snapshot: &StateSnapshot, reason: SnapshotReason) {
        self.metrics.record_snapshot(reason);
        debug!(
            reason = %reason.as_str(),
            state = %snapshot.state.as_str(),
            remaining_seats = %snapshot.remaining_seats,
            "snapshot_emitted"
        );
        for sink in self.sinks.iter_mut() {
            sink.publish(snapshot, reason);
        }
    }

    fn save_checkpoint(&self, now: Instant) {
        if let Some(store) = &self.checkpoint_store {
            store.save(&self.machine.checkpoint(now));
        }
    }

    /// Run the loop until shutdown is signalled, then shut every sink down
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.start(Instant::now());

        let mut ticker = interval(self.sample_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(sample_period_ms = %self.sample_period.as_millis(), "ride_control_loop_started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    self.step(started).await;
                    self.metrics.record_step(started.elapsed().as_micros() as u64);
                }
            }
        }

        self.save_checkpoint(Instant::now());
        for sink in self.sinks.iter_mut() {
            sink.shutdown();
        }
        info!(
            state = %self.machine.state().as_str(),
            remaining_seats = %self.machine.remaining_seats(),
            "ride_controller_shutdown"
        );
    }
}
