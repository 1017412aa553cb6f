//! Errors surfaced by the station application.

use hotfire_core::ConfigError;
use hotfire_safety::SafetyError;
use hotfire_sequence::SequenceError;
use hotfire_serial::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("station has no serial link attached")]
    NoLink,
}
