//! Telemetry-derived valve and pressure state.
//!
//! Inbound telemetry lines are comma-separated `key:value` fields:
//! `pt<N>:<psi>` for pressure channels and `V<idx>_LS_OPEN:<0|1>` /
//! `V<idx>_LS_CLOSED:<0|1>` for limit switches.  Parsing is field-wise:
//! a malformed field is skipped and the rest of the line still applies.

use hotfire_core::{SwitchState, WaitCondition};
use hotfire_serial::codec::{self, InboundLine};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ValveState {
    ls_open: HashMap<u16, bool>,
    ls_closed: HashMap<u16, bool>,
    /// Hundredths of PSI.
    pressures: HashMap<u8, i64>,
}

enum Field {
    Pressure(u8, i64),
    LimitOpen(u16, bool),
    LimitClosed(u16, bool),
}

fn parse_field(field: &str) -> Result<Field, String> {
    let (key, value) = field
        .split_once(':')
        .ok_or_else(|| "missing ':'".to_string())?;
    let (key, value) = (key.trim(), value.trim());

    if let Some(channel) = key.strip_prefix("pt") {
        let channel = channel
            .parse::<u8>()
            .map_err(|_| format!("bad pressure channel '{}'", key))?;
        let psi = value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("non-numeric pressure '{}'", value))?;
        return Ok(Field::Pressure(channel, (psi * 100.0).round() as i64));
    }

    let bit = || match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(format!("limit switch value '{}' is not 0/1", other)),
    };
    if let Some(rest) = key.strip_prefix('V') {
        if let Some(idx) = rest.strip_suffix("_LS_OPEN") {
            let idx = idx.parse::<u16>().map_err(|_| format!("bad valve '{}'", key))?;
            return Ok(Field::LimitOpen(idx, bit()?));
        }
        if let Some(idx) = rest.strip_suffix("_LS_CLOSED") {
            let idx = idx.parse::<u16>().map_err(|_| format!("bad valve '{}'", key))?;
            return Ok(Field::LimitClosed(idx, bit()?));
        }
    }
    Err(format!("unknown key '{}'", key))
}

impl ValveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound line.  Acknowledgments, gate signals and state
    /// markers are ignored.  Returns the number of fields applied.
    pub fn ingest_line(&mut self, line: &str) -> usize {
        let InboundLine::Telemetry(line) = codec::parse_inbound(line) else {
            return 0;
        };
        let mut applied = 0;
        for field in line.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match parse_field(field) {
                Ok(Field::Pressure(ch, value)) => {
                    self.pressures.insert(ch, value);
                    applied += 1;
                }
                Ok(Field::LimitOpen(idx, on)) => {
                    self.ls_open.insert(idx, on);
                    applied += 1;
                }
                Ok(Field::LimitClosed(idx, on)) => {
                    self.ls_closed.insert(idx, on);
                    applied += 1;
                }
                Err(reason) => log::debug!("[telemetry] skipping '{}': {}", field, reason),
            }
        }
        applied
    }

    /// `None` until a switch has reported, or while both switches agree
    /// on nothing (both set, or both clear: valve in travel).
    pub fn limit_switch(&self, valve_index: u16) -> Option<SwitchState> {
        let open = self.ls_open.get(&valve_index).copied();
        let closed = self.ls_closed.get(&valve_index).copied();
        match (open, closed) {
            (Some(true), Some(true)) => None,
            (Some(true), _) => Some(SwitchState::Open),
            (_, Some(true)) => Some(SwitchState::Closed),
            _ => None,
        }
    }

    pub fn pressure_hundredths(&self, sensor_index: u8) -> Option<i64> {
        self.pressures.get(&sensor_index).copied()
    }

    pub fn pressure_psi(&self, sensor_index: u8) -> Option<f64> {
        self.pressure_hundredths(sensor_index).map(|v| v as f64 / 100.0)
    }

    /// Whether `condition` currently holds.  `Time` is never "met": it is
    /// satisfied by elapsed time alone.
    pub fn condition_met(&self, condition: &WaitCondition) -> bool {
        match condition {
            WaitCondition::Time => false,
            WaitCondition::LimitSwitch { valve_index, state } => {
                self.limit_switch(*valve_index) == Some(*state)
            }
            WaitCondition::Pressure {
                sensor_index,
                operator,
                threshold_hundredths_psi,
            } => self
                .pressure_hundredths(*sensor_index)
                .is_some_and(|v| operator.holds(v, *threshold_hundredths_psi)),
        }
    }
}
