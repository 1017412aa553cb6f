//! # Hotfire – Sequence
//!
//! Runs pre-validated valve sequences against the stand controller:
//!
//! - **Steps** – compilation of sequence definitions into executable
//!   `Cmd` / `Wait` steps (valve-name resolution, pressure thresholds in
//!   hundredths of PSI, limit-switch feedback)
//! - **Telemetry** – valve limit-switch and pressure state parsed from
//!   inbound lines, consulted by waits and feedback polling
//! - **Failsafe** – latched, cooldown-guarded close-mains / open-vents drill
//! - **Engine** – single-run execution with cooperative cancellation and
//!   typed events

pub mod sequence;

pub use sequence::*;
