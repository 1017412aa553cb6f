//! # Hotfire – Safety
//!
//! Pre-flight validation of sequence definitions:
//!
//! - **Schema** – required Emergency Shutdown, well-formed commands and
//!   conditions, known valve names
//! - **Static check** – forbidden valve pairs opened in the same step
//! - **Dry run** – timeline replay of inferred valve state, flagging every
//!   moment a forbidden pair is simultaneously OPEN
//! - **Gate** – [`ValidatedSequences`] can only be obtained from a clean
//!   report, so nothing unvalidated reaches the sequence engine

pub mod safety;

pub use safety::*;
