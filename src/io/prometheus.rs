//! Prometheus metrics HTTP endpoint
//!
//! Exposes ride metrics in Prometheus text format at /metrics, a liveness
//! probe at /health and the latest snapshot as JSON at /state.
//! Uses hyper for the HTTP server.

use crate::domain::types::StateSnapshot;
use crate::infra::metrics::{Metrics, MetricsSummary, BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with ride label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    ride: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{ride=\"{ride}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    ride: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{ride=\"{ride}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{ride=\"{ride}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{ride=\"{ride}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{ride=\"{ride}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, ride: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_state_metrics(&mut output, ride, summary);
    write_sensor_metrics(&mut output, ride, summary);
    write_cycle_metrics(&mut output, ride, summary);
    write_loop_metrics(&mut output, ride, summary);

    output
}

fn write_state_metrics(output: &mut String, ride: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "ride_state",
        "Current ride state (0=boarding, 1=running, 2=unloading)",
        MetricType::Gauge,
        ride,
        summary.ride_state,
    );
    write_metric(
        output,
        "ride_remaining_seats",
        "Seats still available in the current cycle",
        MetricType::Gauge,
        ride,
        summary.remaining_seats,
    );
}

fn write_sensor_metrics(output: &mut String, ride: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "ride_entries_detected_total",
        "People counted by the entrance sensor",
        MetricType::Counter,
        ride,
        summary.entries_detected,
    );
    write_metric(
        output,
        "ride_entries_accepted_total",
        "Entries that took a seat",
        MetricType::Counter,
        ride,
        summary.entries_accepted,
    );
    write_metric(
        output,
        "ride_entries_dropped_full_total",
        "Entries dropped because every seat was taken",
        MetricType::Counter,
        ride,
        summary.entries_dropped_full,
    );
    write_metric(
        output,
        "ride_entries_ignored_total",
        "Entries counted outside boarding",
        MetricType::Counter,
        ride,
        summary.entries_ignored,
    );
    write_metric(
        output,
        "ride_exits_detected_total",
        "People counted by the exit sensor",
        MetricType::Counter,
        ride,
        summary.exits_detected,
    );
    write_metric(
        output,
        "ride_exits_accepted_total",
        "Exits counted while unloading",
        MetricType::Counter,
        ride,
        summary.exits_accepted,
    );
    write_metric(
        output,
        "ride_exits_ignored_total",
        "Exits counted outside unloading",
        MetricType::Counter,
        ride,
        summary.exits_ignored,
    );

    let _ = writeln!(output, "# HELP ride_sensor_misses_total Probe reads without an echo");
    let _ = writeln!(output, "# TYPE ride_sensor_misses_total counter");
    let _ = writeln!(
        output,
        "ride_sensor_misses_total{{ride=\"{ride}\",sensor=\"entrance\"}} {}",
        summary.entrance_misses
    );
    let _ = writeln!(
        output,
        "ride_sensor_misses_total{{ride=\"{ride}\",sensor=\"exit\"}} {}",
        summary.exit_misses
    );
}

fn write_cycle_metrics(output: &mut String, ride: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP ride_rides_started_total Rides started, by cause");
    let _ = writeln!(output, "# TYPE ride_rides_started_total counter");
    let _ = writeln!(
        output,
        "ride_rides_started_total{{ride=\"{ride}\",cause=\"full\"}} {}",
        summary.rides_started_full
    );
    let _ = writeln!(
        output,
        "ride_rides_started_total{{ride=\"{ride}\",cause=\"boarding_window\"}} {}",
        summary.rides_started_window
    );

    write_metric(
        output,
        "ride_cycles_completed_total",
        "Cycles that drained and returned to boarding",
        MetricType::Counter,
        ride,
        summary.cycles_completed,
    );
    write_metric(
        output,
        "ride_snapshots_transition_total",
        "Snapshots emitted on state changes",
        MetricType::Counter,
        ride,
        summary.snapshots_transition,
    );
    write_metric(
        output,
        "ride_snapshots_heartbeat_total",
        "Snapshots emitted by the heartbeat",
        MetricType::Counter,
        ride,
        summary.snapshots_heartbeat,
    );
    write_metric(
        output,
        "ride_egress_dropped_total",
        "Bus messages dropped due to channel full",
        MetricType::Counter,
        ride,
        summary.egress_dropped,
    );
}

fn write_loop_metrics(output: &mut String, ride: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "ride_step_latency_us",
        "Control loop step latency in microseconds",
        ride,
        &summary.step_lat_buckets,
        summary.step_lat_avg_us,
    );
    write_metric(
        output,
        "ride_step_latency_p99_us",
        "99th percentile step latency",
        MetricType::Gauge,
        ride,
        summary.step_lat_p99_us,
    );
    write_metric(
        output,
        "ride_step_latency_max_us",
        "Maximum step latency",
        MetricType::Gauge,
        ride,
        summary.step_lat_max_us,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    ride_id: Arc<String>,
    state: watch::Receiver<Option<StateSnapshot>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics.summary(), &ride_id);
            text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".into()),
        (&Method::GET, "/state") => {
            let latest = *state.borrow();
            match latest.map(|s| serde_json::to_string(&s)) {
                Some(Ok(json)) => text_response(StatusCode::OK, "application/json", json),
                Some(Err(e)) => {
                    error!(error = %e, "prometheus_state_encode_failed");
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                }
                None => text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "application/json",
                    r#"{"error":"no_snapshot_yet"}"#.into(),
                ),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".into()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    ride_id: String,
    state: watch::Receiver<Option<StateSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let ride_id = Arc::new(ride_id);

    info!(port = %port, ride = %ride_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let ride_id = ride_id.clone();
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let ride_id = ride_id.clone();
                                let state = state.clone();
                                async move { handle_request(req, metrics, ride_id, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
