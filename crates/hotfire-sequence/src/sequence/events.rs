//! Events published by the sequence engine and the failsafe.

use crate::sequence::failsafe::FailsafeOutcome;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    Started {
        sequence: String,
        run_id: Uuid,
        steps: usize,
    },
    /// `index` is 1-based.
    StepStarted {
        sequence: String,
        index: usize,
        description: String,
    },
    Completed {
        sequence: String,
    },
    Error {
        sequence: String,
        step: Option<usize>,
        message: String,
    },
    /// A failsafe attempt; `tag` names what triggered it.
    Failsafe {
        tag: String,
        outcome: FailsafeOutcome,
    },
}
