//! Station configuration.
//!
//! Covers the serial link, protocol tuning (timeouts, retries, pacing,
//! reconnect), heartbeat cadence, valve and sensor mappings, failsafe
//! roles, and the forbidden valve-pair table.  Every optional field has a
//! serde default so a minimal config only needs the valve mappings.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Serial link
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Physical link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialSettings {
    /// Port name (e.g. `COM3`, `/dev/ttyUSB0`).
    #[serde(default)]
    pub port_name: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Blocking read timeout; a timed-out read counts as "no data".
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_read_timeout() -> u64 {
    50
}
fn default_write_timeout() -> u64 {
    1000
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Protocol tuning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Acknowledged-delivery tuning for the protocol engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSettings {
    /// Default per-attempt acknowledgment timeout.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Attempts allowed before a message fails permanently.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hard cap on queued (not in-flight) messages.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Pacing floor: the minimum gap between consecutive transmissions.
    #[serde(default = "default_pacing_min")]
    pub pacing_min_ms: u64,

    /// Pacing ceiling reached under sustained BUSY pressure.
    #[serde(default = "default_pacing_max")]
    pub pacing_max_ms: u64,

    #[serde(default = "default_pacing_min")]
    pub pacing_initial_ms: u64,

    /// Multiplier applied to the pacing interval on BUSY.
    #[serde(default = "default_busy_backoff_factor")]
    pub busy_backoff_factor: f64,

    /// Multiplier (< 1) applied to the pacing interval on every ACK.
    #[serde(default = "default_pacing_decay")]
    pub pacing_decay: f64,

    /// Hold applied before a BUSY-rejected message is retried.
    #[serde(default = "default_busy_requeue_delay")]
    pub busy_requeue_delay_ms: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Longest a message may wait in the queue before it fails; 0 waits
    /// forever.  The wait restarts when a message is requeued.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

fn default_ack_timeout() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_queue() -> usize {
    64
}
fn default_pacing_min() -> u64 {
    20
}
fn default_pacing_max() -> u64 {
    500
}
fn default_busy_backoff_factor() -> f64 {
    2.0
}
fn default_pacing_decay() -> f64 {
    0.9
}
fn default_busy_requeue_delay() -> u64 {
    50
}
fn default_handshake_timeout() -> u64 {
    3000
}
fn default_reconnect_initial() -> u64 {
    500
}
fn default_reconnect_max() -> u64 {
    10_000
}
fn default_queue_timeout() -> u64 {
    30_000
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            max_retries: default_max_retries(),
            max_queue: default_max_queue(),
            pacing_min_ms: default_pacing_min(),
            pacing_max_ms: default_pacing_max(),
            pacing_initial_ms: default_pacing_min(),
            busy_backoff_factor: default_busy_backoff_factor(),
            pacing_decay: default_pacing_decay(),
            busy_requeue_delay_ms: default_busy_requeue_delay(),
            handshake_timeout_ms: default_handshake_timeout(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Valves, sensors, roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry of the valve name → servo index table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveMapping {
    pub servo_index: u16,

    /// Whether the valve reports limit switches; compiled commands for
    /// such valves wait for switch confirmation.
    #[serde(default)]
    pub feedback: bool,
}

/// Human-readable valve name → servo mapping.
pub type ValveMappings = BTreeMap<String, ValveMapping>;

/// Human-readable sensor name → pressure channel (`ptN`).
pub type SensorMappings = BTreeMap<String, u8>;

/// Servo indices the failsafe procedure acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailsafeRoles {
    /// Closed by the failsafe.
    #[serde(default)]
    pub mains: Vec<u16>,
    /// Opened by the failsafe.
    #[serde(default)]
    pub vents: Vec<u16>,
    /// Opened by the failsafe.
    #[serde(default)]
    pub purges: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailsafeSettings {
    /// Minimum spacing between two admitted failsafe runs.
    #[serde(default = "default_failsafe_cooldown")]
    pub cooldown_ms: u64,

    /// Acknowledgment timeout for the acknowledged failsafe pass.
    #[serde(default = "default_failsafe_ack_timeout")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub on_sequence_error: bool,

    #[serde(default = "default_true")]
    pub on_controller_lost: bool,

    #[serde(default = "default_true")]
    pub cancel_on_controller_lost: bool,
}

fn default_failsafe_cooldown() -> u64 {
    400
}
fn default_failsafe_ack_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Default for FailsafeSettings {
    fn default() -> Self {
        Self {
            cooldown_ms: default_failsafe_cooldown(),
            ack_timeout_ms: default_failsafe_ack_timeout(),
            on_sequence_error: true,
            on_controller_lost: true,
            cancel_on_controller_lost: true,
        }
    }
}

/// Limit-switch confirmation timing for commands with feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSettings {
    #[serde(default = "default_feedback_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll")]
    pub poll_ms: u64,
}

fn default_feedback_timeout() -> u64 {
    2000
}
fn default_poll() -> u64 {
    50
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_feedback_timeout(),
            poll_ms: default_poll(),
        }
    }
}

/// Valve pairs that must never be open at the same time.
pub fn default_forbidden_pairs() -> Vec<(String, String)> {
    [
        ("Ethanol Main", "System Vent"),
        ("N2O Main", "System Vent"),
        ("Ethanol Main", "Nitrogen Purge"),
        ("N2O Main", "Nitrogen Purge"),
        ("System Vent", "Nitrogen Purge"),
    ]
    .iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Station config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Complete station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationConfig {
    #[serde(default)]
    pub serial: SerialSettings,

    #[serde(default)]
    pub protocol: ProtocolSettings,

    /// Standing heartbeat daemon interval (0 disables it).
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,

    /// Heartbeat owned by a running sequence (0 relies on the daemon).
    #[serde(default)]
    pub sequence_heartbeat_ms: u64,

    #[serde(default)]
    pub valve_mappings: ValveMappings,

    #[serde(default)]
    pub sensor_mappings: SensorMappings,

    #[serde(default)]
    pub failsafe_roles: FailsafeRoles,

    #[serde(default)]
    pub failsafe: FailsafeSettings,

    #[serde(default)]
    pub feedback: FeedbackSettings,

    /// Poll interval for `Wait` conditions without an explicit one.
    #[serde(default = "default_poll")]
    pub wait_poll_ms: u64,

    #[serde(default = "default_forbidden_pairs")]
    pub forbidden_pairs: Vec<(String, String)>,
}

fn default_heartbeat() -> u64 {
    500
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            protocol: ProtocolSettings::default(),
            heartbeat_ms: default_heartbeat(),
            sequence_heartbeat_ms: 0,
            valve_mappings: ValveMappings::new(),
            sensor_mappings: SensorMappings::new(),
            failsafe_roles: FailsafeRoles::default(),
            failsafe: FailsafeSettings::default(),
            feedback: FeedbackSettings::default(),
            wait_poll_ms: default_poll(),
            forbidden_pairs: default_forbidden_pairs(),
        }
    }
}

impl StationConfig {
    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.protocol;
        if p.max_queue == 0 {
            return Err(ConfigError::invalid("protocol.maxQueue", "must be at least 1"));
        }
        if p.max_retries == 0 {
            return Err(ConfigError::invalid("protocol.maxRetries", "must be at least 1"));
        }
        if p.pacing_min_ms > p.pacing_max_ms {
            return Err(ConfigError::invalid(
                "protocol.pacingMinMs",
                format!(
                    "floor {}ms is above ceiling {}ms",
                    p.pacing_min_ms, p.pacing_max_ms
                ),
            ));
        }
        if !(p.busy_backoff_factor.is_finite() && p.busy_backoff_factor >= 1.0) {
            return Err(ConfigError::invalid(
                "protocol.busyBackoffFactor",
                "must be a finite number >= 1",
            ));
        }
        if !(p.pacing_decay.is_finite() && p.pacing_decay > 0.0 && p.pacing_decay <= 1.0) {
            return Err(ConfigError::invalid(
                "protocol.pacingDecay",
                "must be in (0, 1]",
            ));
        }
        if p.reconnect_initial_ms == 0 || p.reconnect_initial_ms > p.reconnect_max_ms {
            return Err(ConfigError::invalid(
                "protocol.reconnectInitialMs",
                "must be non-zero and not above reconnectMaxMs",
            ));
        }

        let mut seen = HashSet::new();
        for (name, mapping) in &self.valve_mappings {
            if !seen.insert(mapping.servo_index) {
                return Err(ConfigError::invalid(
                    format!("valveMappings.{}", name),
                    format!("servo index {} is mapped twice", mapping.servo_index),
                ));
            }
        }

        for (a, b) in &self.forbidden_pairs {
            if a == b {
                return Err(ConfigError::invalid(
                    "forbiddenPairs",
                    format!("pair ({}, {}) names the same valve twice", a, b),
                ));
            }
        }
        Ok(())
    }

    /// Resolve a valve name to its servo index.
    pub fn servo_index(&self, valve: &str) -> Option<u16> {
        self.valve_mappings.get(valve).map(|m| m.servo_index)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `<config_dir>/hotfire/station.json`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("hotfire").join("station.json"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Read, parse and validate a station config file.
pub fn load_config(path: &Path) -> Result<StationConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: StationConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    log::info!(
        "[config] loaded {} ({} valves, {} sensors)",
        path.display(),
        config.valve_mappings.len(),
        config.sensor_mappings.len()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg: StationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.serial.baud_rate, 115200);
        assert_eq!(cfg.protocol.max_retries, 5);
        assert_eq!(cfg.failsafe.cooldown_ms, 400);
        assert_eq!(cfg.heartbeat_ms, 500);
        assert_eq!(cfg.forbidden_pairs.len(), 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_camel_case_fields() {
        let cfg: StationConfig = serde_json::from_str(
            r#"{
                "serial": { "portName": "/dev/ttyACM0", "baudRate": 57600 },
                "protocol": { "pacingMinMs": 10, "pacingMaxMs": 200 },
                "valveMappings": { "Ethanol Main": { "servoIndex": 3, "feedback": true } },
                "failsafeRoles": { "mains": [3], "vents": [4, 4] }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.serial.port_name, "/dev/ttyACM0");
        assert_eq!(cfg.protocol.pacing_max_ms, 200);
        assert_eq!(cfg.servo_index("Ethanol Main"), Some(3));
        assert!(cfg.valve_mappings["Ethanol Main"].feedback);
        assert_eq!(cfg.failsafe_roles.vents, vec![4, 4]);
        assert!(cfg.failsafe_roles.purges.is_empty());
    }

    #[test]
    fn test_validate_rejects_inverted_pacing() {
        let mut cfg = StationConfig::default();
        cfg.protocol.pacing_min_ms = 600;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pacingMinMs"));
    }

    #[test]
    fn test_validate_rejects_duplicate_servo() {
        let mut cfg = StationConfig::default();
        cfg.valve_mappings.insert(
            "A".into(),
            ValveMapping { servo_index: 1, feedback: false },
        );
        cfg.valve_mappings.insert(
            "B".into(),
            ValveMapping { servo_index: 1, feedback: false },
        );
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "heartbeatMs": 250 }}"#).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.heartbeat_ms, 250);
    }

    #[test]
    fn test_load_config_parse_error_names_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/station.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
