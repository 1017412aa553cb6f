//! # Station
//!
//! The owning application of the hotfire crates: builds the protocol
//! engine, heartbeat daemon, failsafe and sequence engine from one station
//! config, routes inbound lines (emergency signals, telemetry) and exposes
//! the controller-loss hook.

pub mod error;
pub mod logging;
pub mod station;

pub use error::StationError;
pub use station::*;
