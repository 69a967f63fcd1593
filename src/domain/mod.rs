//! Domain models - plain ride types shared by every layer
//!
//! - `DistanceSample` - one probe reading (or miss)
//! - `RideState` - boarding / running / unloading
//! - `StateSnapshot` - what outputs see after every change and heartbeat

pub mod types;

// Re-export commonly used types at module level
pub use types::{DistanceSample, RideState, SensorRole, SnapshotReason, StateSnapshot};
