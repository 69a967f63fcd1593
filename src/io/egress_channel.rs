//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to hand ride state to the MQTT publisher.
//! Uses a bounded mpsc channel to prevent unbounded memory growth.

use crate::domain::types::{SnapshotReason, StateSnapshot};
use crate::infra::metrics::Metrics;
use crate::io::sink::OutputSink;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug, Clone, PartialEq)]
pub enum EgressMessage {
    /// Ride state snapshot (transition or heartbeat)
    RideState(RideStatePayload),
    /// Controller liveness
    Status(ControllerStatus),
}

/// Liveness published on the retained status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Online,
    Offline,
}

impl ControllerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerStatus::Online => "online",
            ControllerStatus::Offline => "offline",
        }
    }
}

/// Ride state as consumed by the park aggregator
///
/// Lamp flags are 0/1 integers and `ts` is in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RideStatePayload {
    /// Ride identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ride: Option<String>,
    /// Boarding open
    pub green: u8,
    /// Seats remaining
    pub seats: u32,
    /// Ride in progress
    pub yellow: u8,
    /// Unloading
    pub red: u8,
    /// Timestamp (epoch seconds)
    pub ts: u64,
}

impl RideStatePayload {
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            ride: None,
            green: u8::from(snapshot.boarding_open),
            seats: snapshot.remaining_seats,
            yellow: u8::from(snapshot.running),
            red: u8::from(snapshot.unloading),
            ts: snapshot.ts / 1000,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    ride_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, ride_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, ride_id, metrics }
    }

    /// Send a ride state snapshot
    /// Injects ride_id into the payload
    pub fn send_ride_state(&self, snapshot: &StateSnapshot) {
        let mut payload = RideStatePayload::from_snapshot(snapshot);
        payload.ride = Some(self.ride_id.clone());
        self.try_send(EgressMessage::RideState(payload));
    }

    /// Send a liveness update
    pub fn send_status(&self, status: ControllerStatus) {
        self.try_send(EgressMessage::Status(status));
    }

    fn try_send(&self, msg: EgressMessage) {
        // Use try_send to avoid blocking the control loop - drop if channel full
        if let Err(e) = self.tx.try_send(msg) {
            debug!(error = %e, "egress_message_dropped");
            self.metrics.record_egress_dropped();
        }
    }
}

impl OutputSink for EgressSender {
    fn publish(&mut self, snapshot: &StateSnapshot, _reason: SnapshotReason) {
        self.send_ride_state(snapshot);
    }

    fn shutdown(&mut self) {
        self.send_status(ControllerStatus::Offline);
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    ride_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, ride_id, metrics), rx)
}
