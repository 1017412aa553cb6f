//! Transport errors.
//!
//! Every terminal failure names the payload it belongs to so callers can
//! log it verbatim.  The type is `Clone` because a failure is delivered to
//! the sender and also published on the event stream.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("port is not open")]
    NotOpen,

    #[error("queue full, '{payload}' dropped")]
    QueueOverflow { payload: String },

    #[error("'{payload}' rejected by controller: {reason} (attempt {attempts})")]
    Nack {
        payload: String,
        reason: String,
        attempts: u32,
    },

    #[error("'{payload}' not transmitted within {waited_ms}ms")]
    QueueTimeout { payload: String, waited_ms: u64 },

    #[error("'{payload}' not acknowledged after {attempts} attempts")]
    AckTimeout { payload: String, attempts: u32 },

    #[error("write of '{payload}' failed: {reason}")]
    Write { payload: String, reason: String },

    #[error("no READY or ACK for HELLO within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("'{payload}' aborted: {reason}")]
    Aborted { payload: String, reason: String },

    #[error("port enumeration failed: {0}")]
    Enumerate(String),

    #[error("protocol engine has stopped")]
    EngineStopped,
}

impl TransportError {
    /// Payload the error refers to, if any.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::QueueOverflow { payload }
            | Self::Nack { payload, .. }
            | Self::QueueTimeout { payload, .. }
            | Self::AckTimeout { payload, .. }
            | Self::Write { payload, .. }
            | Self::Aborted { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_payload() {
        let err = TransportError::Nack {
            payload: "V,1,O".into(),
            reason: "CRC_ERR".into(),
            attempts: 5,
        };
        let text = err.to_string();
        assert!(text.contains("V,1,O"));
        assert!(text.contains("CRC_ERR"));
        assert_eq!(err.payload(), Some("V,1,O"));
        assert_eq!(TransportError::NotOpen.payload(), None);
    }
}
