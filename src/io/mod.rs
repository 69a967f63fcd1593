//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `probe` - Distance probes (serial sensor bridge, scripted readings)
//! - `sink` - Output sink trait and in-process sinks
//! - `indicators` - Lamps and seat lights
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for ride state and liveness
//! - `dashboard` - HTTP push of ride state
//! - `checkpoint` - Cycle checkpoint file
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod checkpoint;
pub mod dashboard;
pub mod egress_channel;
pub mod indicators;
pub mod mqtt_egress;
pub mod probe;
pub mod prometheus;
pub mod sink;

// Re-export commonly used types
pub use checkpoint::CheckpointStore;
pub use dashboard::{create_dashboard, DashboardPusher, DashboardSink};
pub use egress_channel::{create_egress_channel, ControllerStatus, EgressSender, RideStatePayload};
pub use indicators::{IndicatorDriver, IndicatorFrame, IndicatorPanel, LogDriver};
pub use mqtt_egress::MqttPublisher;
pub use probe::{probe_for, DistanceProbe, ScriptedProbe, SerialDistanceProbe};
pub use sink::{OutputSink, RecordingSink, SharedRecordingSink, WatchSink};
