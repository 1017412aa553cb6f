//! # Hotfire – Serial Link
//!
//! Reliable command delivery to the stand controller over a serial line:
//!
//! - **Codec** – `<payload>,<id>,<crc8>` framing, frame verification, and
//!   classification of inbound lines (ACK / NACK / gate signals / telemetry)
//! - **Transport** – `serialport`-backed and in-memory link transports,
//!   port listing, inbound line splitting
//! - **Protocol Engine** – single in-flight message, FIFO queue with
//!   priority-aware overflow, retries, adaptive pacing, handshake and
//!   reconnect, typed event fan-out
//! - **Heartbeat** – periodic `HB` liveness daemon

pub mod link;

pub use link::*;
