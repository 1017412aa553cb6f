//! Safety crate: sub-modules.

pub mod types;
pub mod error;
pub mod checks;
pub mod engine;

// Re-export top-level items for convenience.
pub use engine::{SafetyEngine, ValidatedSequences};
pub use error::SafetyError;
pub use types::*;
