//! Wire codec.
//!
//! Outbound commands are framed as `<payload>,<id>,<HH>` where `HH` is the
//! uppercase CRC-8 (poly 0x07, init 0, unreflected) of `"<payload>,<id>"`.
//! Inbound lines are classified into acknowledgments, gate signals, state
//! markers and telemetry.  Malformed acknowledgments are classified, never
//! panicked on.

use crc::{Crc, CRC_8_SMBUS};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Liveness command.
pub const HEARTBEAT: &str = "HB";

/// Handshake command sent after opening the port.
pub const HELLO: &str = "HELLO";

/// Commands that are never evicted on queue overflow.
pub const PRIORITY_PREFIXES: [&str; 4] = ["EMERG", "FAILSAFE", "HB", "SAFE_CLEAR"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// `<payload>,<id>,<HH>` without a line terminator.
pub fn frame(payload: &str, id: u64) -> String {
    let body = format!("{},{}", payload, id);
    let crc = crc8(body.as_bytes());
    format!("{},{:02X}", body, crc)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub payload: String,
    pub id: u64,
}

/// Split and verify a framed line.  Returns `None` when the line is not a
/// frame or the checksum does not match.
pub fn decode_frame(line: &str) -> Option<DecodedFrame> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.rsplitn(3, ',');
    let crc_hex = parts.next()?;
    let id_str = parts.next()?;
    let payload = parts.next()?;
    if crc_hex.len() != 2 || payload.is_empty() {
        return None;
    }
    let received = u8::from_str_radix(crc_hex, 16).ok()?;
    let id = id_str.parse::<u64>().ok()?;
    let expected = crc8(format!("{},{}", payload, id_str).as_bytes());
    if received != expected {
        return None;
    }
    Some(DecodedFrame {
        payload: payload.to_string(),
        id,
    })
}

/// Whether `payload` is exempt from overflow eviction.
pub fn is_priority(payload: &str) -> bool {
    let head = payload.trim_start();
    PRIORITY_PREFIXES.iter().any(|p| head.starts_with(p))
}

pub fn is_heartbeat(payload: &str) -> bool {
    payload.trim() == HEARTBEAT
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inbound classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classification of one inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    Ack { id: u64 },
    Nack { id: u64, reason: String },
    Ready,
    Idle,
    /// `BUSY` or `NACK,BUSY` without a message id.
    Busy,
    Emergency(String),
    EmergencyCleared,
    Failsafe(String),
    Telemetry(String),
    Malformed { line: String, reason: String },
}

impl InboundLine {
    /// State markers are logged but never reparsed as telemetry.
    pub fn is_state_marker(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Emergency(_) | Self::EmergencyCleared | Self::Failsafe(_)
        )
    }
}

fn malformed(line: &str, reason: impl Into<String>) -> InboundLine {
    InboundLine::Malformed {
        line: line.to_string(),
        reason: reason.into(),
    }
}

pub fn parse_inbound(raw: &str) -> InboundLine {
    let line = raw.trim();
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    match fields[0] {
        "ACK" => {
            let Some(id) = fields.get(1) else {
                return malformed(line, "ACK without message id");
            };
            match id.parse::<u64>() {
                Ok(id) => InboundLine::Ack { id },
                Err(_) => malformed(line, format!("non-numeric ACK id '{}'", id)),
            }
        }
        "NACK" => match fields.get(1) {
            None => malformed(line, "NACK without message id"),
            Some(&"BUSY") => InboundLine::Busy,
            Some(id) => {
                let Ok(id) = id.parse::<u64>() else {
                    return malformed(line, format!("non-numeric NACK id '{}'", id));
                };
                match fields.get(2) {
                    Some(reason) if !reason.is_empty() => InboundLine::Nack {
                        id,
                        reason: fields[2..].join(","),
                    },
                    _ => malformed(line, "NACK without reason"),
                }
            }
        },
        "READY" => InboundLine::Ready,
        "IDLE" => InboundLine::Idle,
        "BUSY" => InboundLine::Busy,
        _ if line.starts_with("EMERG_CLEARED") => InboundLine::EmergencyCleared,
        _ if line.starts_with("EMERG") => InboundLine::Emergency(line.to_string()),
        _ if line.starts_with("FAILSAFE") => InboundLine::Failsafe(line.to_string()),
        _ => InboundLine::Telemetry(line.to_string()),
    }
}
