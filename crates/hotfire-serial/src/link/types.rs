//! Shared types for the serial link crate.
//!
//! Covers per-send options, connection state, engine events, statistics
//! and the engine snapshot.

use crate::link::error::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Send options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-message overrides of the engine's protocol defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub ack_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl SendOptions {
    pub fn with_ack_timeout(ms: u64) -> Self {
        Self {
            ack_timeout: Some(Duration::from_millis(ms)),
            max_retries: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Disconnected,
    /// Port open, waiting for READY or the HELLO acknowledgment.
    Handshaking,
    Connected,
    /// Link lost unexpectedly; a reopen is scheduled.
    Reconnecting,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Connection status changes published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Connected { port: String },
    Disconnected { port: String, reason: String },
    Reconnecting { port: String, attempt: u32, delay_ms: u64 },
}

/// Events fanned out to every subscriber of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound line, exactly as received (terminator stripped).
    Data(String),
    /// Terminal failure of a message or the link.
    Error(TransportError),
    Status(LinkStatus),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Statistics / snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters kept by the protocol engine over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub frames_sent: u64,
    pub priority_writes: u64,
    pub acks: u64,
    pub nacks: u64,
    pub busy_signals: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub failures: u64,
    pub evictions: u64,
    pub heartbeats_skipped: u64,
    pub reconnects: u64,
    pub lines_rx: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InflightInfo {
    pub id: u64,
    pub payload: String,
    pub attempts: u32,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub port: String,
    pub state: LinkState,
    pub queue_len: usize,
    pub inflight: Option<InflightInfo>,
    pub pacing_ms: u64,
    pub remote_ready: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub stats: LinkStats,
}

/// An entry of [`available_ports`](crate::link::transport::available_ports).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSummary {
    pub name: String,
    pub kind: String,
}
