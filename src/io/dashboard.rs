//! HTTP push of ride state to a dashboard service
//!
//! The control loop only swaps the latest snapshot into a `watch` channel.
//! A separate pusher task POSTs whatever is current on a fixed cadence, so a
//! slow or unreachable dashboard costs at most one request timeout per push
//! on the pusher task and nothing on the loop.

use crate::domain::types::{SnapshotReason, StateSnapshot};
use crate::io::egress_channel::RideStatePayload;
use crate::io::sink::OutputSink;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Sink side: keeps the latest snapshot for the pusher
pub struct DashboardSink {
    tx: watch::Sender<Option<StateSnapshot>>,
}

impl OutputSink for DashboardSink {
    fn publish(&mut self, snapshot: &StateSnapshot, _reason: SnapshotReason) {
        self.tx.send_replace(Some(*snapshot));
    }
}

/// Worker side: POSTs the latest snapshot as JSON
pub struct DashboardPusher {
    client: reqwest::Client,
    url: String,
    ride_id: String,
    push_interval: Duration,
    rx: watch::Receiver<Option<StateSnapshot>>,
}

/// Create the sink/pusher pair
pub fn create_dashboard(
    url: &str,
    ride_id: &str,
    push_interval: Duration,
    timeout: Duration,
) -> anyhow::Result<(DashboardSink, DashboardPusher)> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let (tx, rx) = watch::channel(None);
    let pusher = DashboardPusher {
        client,
        url: url.to_string(),
        ride_id: ride_id.to_string(),
        push_interval,
        rx,
    };
    Ok((DashboardSink { tx }, pusher))
}

impl DashboardPusher {
    /// Payload for the current snapshot, if any snapshot was published yet
    fn current_payload(&self) -> Option<RideStatePayload> {
        let snapshot = (*self.rx.borrow())?;
        let mut payload = RideStatePayload::from_snapshot(&snapshot);
        payload.ride = Some(self.ride_id.clone());
        Some(payload)
    }

    /// Push until the sink is dropped or shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            url = %self.url,
            interval_ms = %self.push_interval.as_millis(),
            "dashboard_pusher_started"
        );

        let mut push_timer = interval(self.push_interval);
        push_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dashboard_pusher_shutdown");
                        return;
                    }
                }
                _ = push_timer.tick() => {
                    if self.rx.has_changed().is_err() {
                        info!("dashboard_pusher_sink_closed");
                        return;
                    }
                    if let Some(payload) = self.current_payload() {
                        self.push(&payload).await;
                    }
                }
            }
        }
    }

    async fn push(&self, payload: &RideStatePayload) {
        match self.client.post(&self.url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(status = %resp.status(), seats = %payload.seats, "dashboard_pushed");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "dashboard_push_rejected");
            }
            Err(e) => {
                warn!(error = %e, "dashboard_push_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RideState;

    #[tokio::test]
    async fn test_sink_feeds_latest_snapshot_to_pusher() {
        let (mut sink, pusher) = create_dashboard(
            "http://127.0.0.1:9/ride",
            "ride1",
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .unwrap();

        assert!(pusher.current_payload().is_none());

        sink.publish(&StateSnapshot::new(RideState::Boarding, 4, 0), SnapshotReason::Startup);
        sink.publish(&StateSnapshot::new(RideState::Running, 1, 9_000), SnapshotReason::Transition);

        let payload = pusher.current_payload().unwrap();
        assert_eq!(payload.ride.as_deref(), Some("ride1"));
        assert_eq!(payload.yellow, 1);
        assert_eq!(payload.seats, 1);
        assert_eq!(payload.ts, 9);
    }

    #[tokio::test]
    async fn test_pusher_stops_when_sink_dropped() {
        let (sink, pusher) = create_dashboard(
            "http://127.0.0.1:9/ride",
            "ride1",
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        drop(sink);
        tokio::time::timeout(Duration::from_secs(1), pusher.run(shutdown_rx))
            .await
            .expect("pusher should stop once the sink is gone");
    }
}
