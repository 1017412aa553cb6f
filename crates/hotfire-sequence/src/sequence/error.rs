//! Sequence errors.

use hotfire_serial::TransportError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SequenceError {
    #[error("unknown sequence '{0}'")]
    UnknownSequence(String),

    #[error("sequence '{running}' is already running")]
    AlreadyRunning { running: String },

    #[error("unknown valve '{valve}' in '{command}'")]
    UnknownValve { valve: String, command: String },

    #[error("unsupported command syntax '{0}'")]
    UnsupportedCommand(String),

    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),

    #[error("invalid condition on '{sensor}': {reason}")]
    InvalidCondition { sensor: String, reason: String },

    #[error("'{payload}' failed: {source}")]
    Send {
        payload: String,
        #[source]
        source: TransportError,
    },

    #[error("V{valve_index} did not report {expected} within {timeout_ms}ms")]
    FeedbackTimeout {
        valve_index: u16,
        expected: String,
        timeout_ms: u64,
    },

    #[error("timed out after {timeout_ms}ms waiting for {condition}")]
    WaitTimeout { condition: String, timeout_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    /// Any of the above, located in a sequence.
    #[error("'{sequence}' step {step}: {source}")]
    Step {
        sequence: String,
        step: usize,
        #[source]
        source: Box<SequenceError>,
    },
}

impl SequenceError {
    pub fn at(self, sequence: &str, step: usize) -> Self {
        Self::Step {
            sequence: sequence.to_string(),
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, past any step location.
    pub fn root(&self) -> &SequenceError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }
}
