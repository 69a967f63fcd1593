//! Services - ride logic and the control loop
//!
//! - `edge_counter` - Debounced people counting on one distance sensor
//! - `ride` - Boarding / running / unloading state machine
//! - `controller` - Single-owner loop tying probes, state machine and sinks

pub mod controller;
pub mod edge_counter;
pub mod ride;

// Re-export commonly used types
pub use controller::RideController;
pub use edge_counter::DebouncedEdgeCounter;
pub use ride::{CycleCheckpoint, RideStartCause, RideStateMachine, RideTimings};
