//! Utility modules

pub mod pump;

pub use pump::{BridgePump, PumpStats, PumpStep};
