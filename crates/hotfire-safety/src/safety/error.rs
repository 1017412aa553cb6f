//! Safety errors.

use crate::safety::types::SafetyReport;
use hotfire_core::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown sequence '{0}'")]
    UnknownSequence(String),

    #[error("sequence set failed safety validation: {}", .0.summary())]
    Invalid(SafetyReport),
}
