//! The command-link seam between the protocol engine and its users.

use crate::link::error::TransportError;
use crate::link::types::SendOptions;

/// What the sequence engine, failsafe and heartbeat need from a link.
///
/// `ProtocolEngine` is the production implementation; tests substitute a
/// recording mock.
#[async_trait::async_trait]
pub trait CommandLink: Send + Sync {
    /// Queue `payload` for acknowledged delivery and wait for the outcome.
    async fn send(&self, payload: &str, opts: SendOptions) -> Result<(), TransportError>;

    /// Write `payload` unframed, bypassing the queue.
    async fn write_now(&self, payload: &str) -> Result<(), TransportError>;

    /// Drop every queued (not in-flight) message.
    async fn clear_queue(&self);

    /// Fail the in-flight message, if any.
    async fn abort_inflight(&self, reason: &str);

    /// Fail every message still awaiting acknowledgment, in-flight included.
    async fn abort_all_pendings(&self, reason: &str);
}
