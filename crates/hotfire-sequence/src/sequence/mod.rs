//! Sequence crate: sub-modules.

pub mod error;
pub mod events;
pub mod steps;
pub mod telemetry;
pub mod failsafe;
pub mod engine;

// Re-export top-level items for convenience.
pub use engine::{EngineOptions, RunStatus, SequenceEngine};
pub use error::SequenceError;
pub use events::SequenceEvent;
pub use failsafe::{Failsafe, FailsafeOutcome, FailsafeStatus, ValveRoles};
pub use steps::{to_steps, translate_command, CompileContext};
pub use telemetry::ValveState;
