//! Sequence definitions.
//!
//! Two layers live here.  The *definition* layer ([`SequenceEntry`],
//! [`SequenceRecord`], [`ConditionDescriptor`]) mirrors the external
//! sequence file, where a sequence is an ordered list of strings, typed
//! steps, or `{message, delay, commands, condition}` records.  The
//! *executable* layer ([`SequenceStep`], [`WaitCondition`]) is what the
//! sequence engine interprets; typed entries in a file already use it and
//! pass through compilation unchanged.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// The designated exit path; must exist in every sequence file.  It is
/// exempt from dry-run checks, and starting it cancels whatever sequence
/// is running instead of being refused.
pub const EMERGENCY_SHUTDOWN: &str = "Emergency Shutdown";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Executable steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Limit-switch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchState {
    Open,
    Closed,
}

impl SwitchState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }
}

/// Comparison applied to a pressure reading.  Sequence files may spell it
/// as a symbol or a word (`>=`, `gte`, `ge`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
        }
    }

    /// Integer comparison in hundredths of PSI.
    pub fn holds(&self, value: i64, threshold: i64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Eq => value == threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "gte" | "ge" => Ok(Self::Ge),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "lte" | "le" => Ok(Self::Le),
            "==" | "=" | "eq" => Ok(Self::Eq),
            other => Err(format!("unknown comparison operator '{}'", other)),
        }
    }
}

impl TryFrom<String> for Comparison {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// What a `Wait` step waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WaitCondition {
    /// Pure delay; completes once the step timeout has elapsed.
    Time,
    LimitSwitch {
        valve_index: u16,
        state: SwitchState,
    },
    Pressure {
        sensor_index: u8,
        operator: Comparison,
        threshold_hundredths_psi: i64,
    },
}

/// Limit-switch confirmation attached to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub valve_index: u16,
    pub expected: SwitchState,
    pub timeout_ms: u64,
    pub poll_ms: u64,
}

/// One executable unit of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SequenceStep {
    Cmd {
        payload: String,
        /// `None` uses the link's default acknowledgment timeout.
        #[serde(default)]
        ack_timeout_ms: Option<u64>,
        #[serde(default)]
        feedback: Option<Feedback>,
    },
    Wait {
        condition: WaitCondition,
        timeout_ms: u64,
        /// `0` uses the engine's default poll interval.
        #[serde(default)]
        poll_ms: u64,
    },
}

impl SequenceStep {
    pub fn cmd(payload: impl Into<String>) -> Self {
        Self::Cmd {
            payload: payload.into(),
            ack_timeout_ms: None,
            feedback: None,
        }
    }

    pub fn delay(ms: u64) -> Self {
        Self::Wait {
            condition: WaitCondition::Time,
            timeout_ms: ms,
            poll_ms: 0,
        }
    }

    /// Short human-readable description for logs and events.
    pub fn describe(&self) -> String {
        match self {
            Self::Cmd { payload, .. } => format!("cmd {}", payload),
            Self::Wait {
                condition: WaitCondition::Time,
                timeout_ms,
                ..
            } => format!("wait {}ms", timeout_ms),
            Self::Wait {
                condition: WaitCondition::LimitSwitch { valve_index, state },
                timeout_ms,
                ..
            } => format!(
                "wait V{} {} (timeout {}ms)",
                valve_index,
                state.label(),
                timeout_ms
            ),
            Self::Wait {
                condition:
                    WaitCondition::Pressure {
                        sensor_index,
                        operator,
                        threshold_hundredths_psi,
                    },
                timeout_ms,
                ..
            } => format!(
                "wait pt{} {} {:.2} psi (timeout {}ms)",
                sensor_index,
                operator,
                *threshold_hundredths_psi as f64 / 100.0,
                timeout_ms
            ),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Definition format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trailing pressure condition on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDescriptor {
    /// Sensor name (`sensorMappings`) or literal `ptN`.
    pub sensor: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub operator: Option<Comparison>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

/// `{message, delay, commands, condition}` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRecord {
    #[serde(default)]
    pub message: String,
    /// Milliseconds to wait before the commands fire.
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub condition: Option<ConditionDescriptor>,
}

/// A raw entry of a sequence as written in the definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceEntry {
    Command(String),
    Step(SequenceStep),
    Record(SequenceRecord),
}

impl SequenceEntry {
    /// Commands this entry would transmit, in order.
    pub fn commands(&self) -> Vec<&str> {
        match self {
            Self::Command(c) => vec![c.as_str()],
            Self::Step(SequenceStep::Cmd { payload, .. }) => vec![payload.as_str()],
            Self::Step(SequenceStep::Wait { .. }) => Vec::new(),
            Self::Record(r) => r.commands.iter().map(String::as_str).collect(),
        }
    }

    /// Pure delay this entry contributes to the sequence timeline.
    pub fn delay_ms(&self) -> f64 {
        match self {
            Self::Record(r) if r.delay.is_finite() && r.delay > 0.0 => r.delay,
            Self::Step(SequenceStep::Wait {
                condition: WaitCondition::Time,
                timeout_ms,
                ..
            }) => *timeout_ms as f64,
            _ => 0.0,
        }
    }
}

/// Sequence name → ordered entries.
pub type SequenceMap = BTreeMap<String, Vec<SequenceEntry>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Valve commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Direction of a valve command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValveAction {
    Open,
    Close,
}

impl ValveAction {
    /// Wire letter used in `V,<idx>,<O|C>`.
    pub fn letter(&self) -> char {
        match self {
            Self::Open => 'O',
            Self::Close => 'C',
        }
    }

    pub fn expected_switch(&self) -> SwitchState {
        match self {
            Self::Open => SwitchState::Open,
            Self::Close => SwitchState::Closed,
        }
    }
}

/// A syntactically valid valve command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveCommand<'a> {
    /// `V,<idx>,<O|C>`
    Raw { index: u16, action: ValveAction },
    /// `CMD,<ValveName>,(Open|Close)`
    Named { valve: &'a str, action: ValveAction },
}

/// Parse either command form; `None` for anything else.
pub fn parse_valve_command(command: &str) -> Option<ValveCommand<'_>> {
    let parts: Vec<&str> = command.trim().split(',').map(str::trim).collect();
    match parts.as_slice() {
        ["V", idx, action] => {
            let index = idx.parse::<u16>().ok()?;
            let action = match *action {
                "O" => ValveAction::Open,
                "C" => ValveAction::Close,
                _ => return None,
            };
            Some(ValveCommand::Raw { index, action })
        }
        ["CMD", valve, action] if !valve.is_empty() => {
            let action = match *action {
                "Open" => ValveAction::Open,
                "Close" => ValveAction::Close,
                _ => return None,
            };
            Some(ValveCommand::Named { valve, action })
        }
        _ => None,
    }
}

/// Raw wire form for a servo index.
pub fn raw_valve_command(index: u16, action: ValveAction) -> String {
    format!("V,{},{}", index, action.letter())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read and parse a sequence definition file.  Structural validity only;
/// safety validation happens separately.
pub fn load_sequences(path: &Path) -> Result<SequenceMap, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let map: SequenceMap = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("[config] loaded {} sequences from {}", map.len(), path.display());
    Ok(map)
}
