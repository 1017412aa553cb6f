//! Link crate: sub-modules.

pub mod types;
pub mod error;
pub mod codec;
pub mod transport;
pub mod pacing;
pub mod command;
pub mod engine;
pub mod heartbeat;

// Re-export top-level items for convenience.
pub use command::CommandLink;
pub use engine::ProtocolEngine;
pub use error::TransportError;
pub use heartbeat::{Heartbeat, HeartbeatControl};
pub use transport::{available_ports, LineSplitter, LinkTransport, SerialPortTransport, SimulatedTransport};
pub use types::*;
