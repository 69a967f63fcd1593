//! Ride controller - seat counting and boarding control for one ride
//!
//! Counts riders with two ultrasonic sensors (entrance and exit), runs the
//! boarding / running / unloading cycle and publishes the ride state to the
//! indicators, the park MQTT broker and (optionally) a dashboard.
//!
//! Module structure:
//! - `domain/` - Plain ride types (samples, states, snapshots)
//! - `io/` - External interfaces (probes, sinks, MQTT, dashboard, Prometheus)
//! - `services/` - Ride logic (edge counter, state machine, control loop)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use ride_controller::domain::types::SensorRole;
use ride_controller::infra::{Config, Metrics};
use ride_controller::io::{
    create_dashboard, create_egress_channel, probe_for, CheckpointStore, IndicatorPanel, LogDriver,
    MqttPublisher, WatchSink,
};
use ride_controller::services::{RideController, RideStateMachine};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Ride controller - boarding control from two distance sensors
#[derive(Parser, Debug)]
#[command(name = "ride-controller", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Capacity of the MQTT egress queue
const EGRESS_BUFFER: usize = 256;

/// How long the publisher gets to flush the final messages
const EGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Fresh machine, or the cycle from the checkpoint file when one is usable
fn initial_machine(config: &Config, store: Option<&CheckpointStore>) -> RideStateMachine {
    let fresh = || RideStateMachine::new(config.capacity(), config.ride_timings());
    let Some(store) = store else {
        return fresh();
    };

    match store.load() {
        Ok(Some(checkpoint)) => {
            match RideStateMachine::resume(
                config.capacity(),
                config.ride_timings(),
                &checkpoint,
                Instant::now(),
            ) {
                Ok(machine) => machine,
                Err(e) => {
                    warn!(error = %e, "checkpoint_rejected_starting_fresh");
                    fresh()
                }
            }
        }
        Ok(None) => fresh(),
        Err(e) => {
            warn!(error = %e, "checkpoint_unreadable_starting_fresh");
            fresh()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for every snapshot
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let version = env!("CARGO_PKG_VERSION");
    let revision = env!("RIDE_CONTROLLER_REVISION");
    info!(version = %version, revision = %revision, "ride-controller starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path).context("configuration rejected")?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        ride = %config.ride_id(),
        capacity = %config.capacity(),
        near_threshold_cm = %config.near_threshold_cm(),
        cooldown_ms = %config.cooldown().as_millis(),
        sample_period_ms = %config.sample_period().as_millis(),
        boarding_window_ms = %config.ride_timings().boarding_window.as_millis(),
        ride_duration_ms = %config.ride_timings().ride_duration.as_millis(),
        heartbeat_ms = %config.heartbeat_period().as_millis(),
        mqtt_enabled = %config.mqtt_enabled(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        dashboard_enabled = %config.dashboard_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Probes
    let entrance = probe_for(
        SensorRole::Entrance,
        config.entrance_device(),
        config.entrance_baud(),
        config.read_timeout(),
    );
    let exit = probe_for(SensorRole::Exit, config.exit_device(), config.exit_baud(), config.read_timeout());

    // State machine, resumed from the checkpoint when possible
    let checkpoint_store = config.checkpoint_file().map(CheckpointStore::new);
    let machine = initial_machine(&config, checkpoint_store.as_ref());

    let mut controller = RideController::with_machine(&config, entrance, exit, machine, metrics.clone());
    if let Some(store) = checkpoint_store {
        controller = controller.with_checkpoint_store(store);
    }

    controller.add_sink(Box::new(IndicatorPanel::new(LogDriver, config.capacity())));

    // MQTT egress (drained after the control loop stops)
    let publisher_handle = if config.mqtt_enabled() {
        let (egress_sender, egress_rx) =
            create_egress_channel(EGRESS_BUFFER, config.ride_id().to_string(), metrics.clone());
        controller.add_sink(Box::new(egress_sender));

        let publisher = MqttPublisher::new(&config, egress_rx);
        Some(tokio::spawn(async move {
            publisher.run().await;
        }))
    } else {
        info!("mqtt_egress_disabled");
        None
    };

    // Dashboard push
    if config.dashboard_enabled() {
        let (dashboard_sink, pusher) = create_dashboard(
            config.dashboard_url(),
            config.ride_id(),
            config.dashboard_push_interval(),
            config.dashboard_timeout(),
        )
        .context("failed to build dashboard client")?;
        controller.add_sink(Box::new(dashboard_sink));

        let pusher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            pusher.run(pusher_shutdown).await;
        });
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let (state_sink, state_rx) = WatchSink::new();
        controller.add_sink(Box::new(state_sink));

        let prom_metrics = metrics.clone();
        let prom_ride = config.ride_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = ride_controller::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_ride,
                state_rx,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
        }
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run the control loop until shutdown
    controller.run(shutdown_rx).await;

    // Dropping the controller drops the egress sender, which lets the publisher drain and exit
    drop(controller);
    if let Some(handle) = publisher_handle {
        if tokio::time::timeout(EGRESS_DRAIN_TIMEOUT, handle).await.is_err() {
            warn!(timeout_ms = %EGRESS_DRAIN_TIMEOUT.as_millis(), "mqtt_egress_drain_timeout");
        }
    }

    metrics.report().log();
    info!("ride-controller shutdown complete");
    Ok(())
}
