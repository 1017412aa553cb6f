//! Step compilation.
//!
//! Turns the entries of a sequence definition into executable steps:
//!
//! - a bare string is one `Cmd` step, run through [`translate_command`]
//! - a typed step passes through unchanged
//! - a record yields at most one `Wait{Time}` (only for a positive delay),
//!   one `Cmd` per command, then one `Wait{Pressure}` per condition bound

use crate::sequence::error::SequenceError;
use hotfire_core::{
    parse_valve_command, raw_valve_command, ConditionDescriptor, FeedbackSettings,
    SensorMappings, SequenceEntry, StationConfig, ValveCommand, ValveMappings,
};
use std::time::Duration;

pub use hotfire_core::{Comparison, Feedback, SequenceStep, WaitCondition};

/// Timeout for a record condition that does not name one.
pub const DEFAULT_CONDITION_TIMEOUT_MS: u64 = 30_000;

const SLEEP_WORDS: [&str; 5] = ["sleep", "delay", "wait", "pause", "hold"];

/// Lookup tables and defaults used while compiling.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    pub valves: ValveMappings,
    pub sensors: SensorMappings,
    pub feedback: FeedbackSettings,
    pub condition_timeout_ms: u64,
}

impl CompileContext {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            valves: config.valve_mappings.clone(),
            sensors: config.sensor_mappings.clone(),
            feedback: config.feedback.clone(),
            condition_timeout_ms: DEFAULT_CONDITION_TIMEOUT_MS,
        }
    }
}

/// Duration of a `sleep/delay/wait/pause/hold <n>[ms|s]` token, or `None`
/// when `payload` is not one.  Separators may be a space, `,`, `:` or `=`.
pub fn sleep_duration(payload: &str) -> Option<Duration> {
    let lower = payload.trim().to_ascii_lowercase();
    let (word, rest) =
        lower.split_once(|c: char| c == ',' || c == ':' || c == '=' || c.is_whitespace())?;
    if !SLEEP_WORDS.contains(&word) {
        return None;
    }
    let rest = rest.trim();
    let (number, scale) = if let Some(n) = rest.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = rest.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (rest, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_millis((value * scale).round() as u64))
}

/// Map one command string to a `Cmd` step.
///
/// `V,<idx>,<O|C>`, sleep tokens and other mnemonics pass through.
/// `CMD,<Valve>,(Open|Close)` resolves through the valve mappings and
/// gains limit-switch feedback when the mapping asks for it.  A
/// malformed `V`/`CMD` command is an error.
pub fn translate_command(command: &str, ctx: &CompileContext) -> Result<SequenceStep, SequenceError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(SequenceError::UnsupportedCommand(command.to_string()));
    }
    if sleep_duration(command).is_some() {
        return Ok(SequenceStep::cmd(command));
    }

    match parse_valve_command(command) {
        Some(ValveCommand::Raw { .. }) => Ok(SequenceStep::cmd(command)),
        Some(ValveCommand::Named { valve, action }) => {
            let mapping = ctx
                .valves
                .get(valve)
                .ok_or_else(|| SequenceError::UnknownValve {
                    valve: valve.to_string(),
                    command: command.to_string(),
                })?;
            let feedback = mapping.feedback.then(|| Feedback {
                valve_index: mapping.servo_index,
                expected: action.expected_switch(),
                timeout_ms: ctx.feedback.timeout_ms,
                poll_ms: ctx.feedback.poll_ms,
            });
            Ok(SequenceStep::Cmd {
                payload: raw_valve_command(mapping.servo_index, action),
                ack_timeout_ms: None,
                feedback,
            })
        }
        None => match command.split(',').next().map(str::trim) {
            Some("V" | "CMD") => Err(SequenceError::UnsupportedCommand(command.to_string())),
            _ => Ok(SequenceStep::cmd(command)),
        },
    }
}

fn sensor_index(sensor: &str, ctx: &CompileContext) -> Result<u8, SequenceError> {
    if let Some(idx) = ctx.sensors.get(sensor) {
        return Ok(*idx);
    }
    let lower = sensor.trim().to_ascii_lowercase();
    lower
        .strip_prefix("pt")
        .and_then(|n| n.parse::<u8>().ok())
        .ok_or_else(|| SequenceError::UnknownSensor(sensor.to_string()))
}

fn hundredths(sensor: &str, psi: f64) -> Result<i64, SequenceError> {
    if !psi.is_finite() {
        return Err(SequenceError::InvalidCondition {
            sensor: sensor.to_string(),
            reason: format!("threshold {} is not finite", psi),
        });
    }
    Ok((psi * 100.0).round() as i64)
}

/// A record condition as pressure waits.  An explicit operator applies to
/// `min` (or `max` if only that is set); otherwise `min` means `>=` and
/// `max` means `<=`, one wait each.
fn condition_steps(
    cond: &ConditionDescriptor,
    ctx: &CompileContext,
) -> Result<Vec<SequenceStep>, SequenceError> {
    let sensor_index = sensor_index(&cond.sensor, ctx)?;
    let timeout_ms = cond.timeout_ms.unwrap_or(ctx.condition_timeout_ms);
    let wait = |operator: Comparison, psi: f64| -> Result<SequenceStep, SequenceError> {
        Ok(SequenceStep::Wait {
            condition: WaitCondition::Pressure {
                sensor_index,
                operator,
                threshold_hundredths_psi: hundredths(&cond.sensor, psi)?,
            },
            timeout_ms,
            poll_ms: 0,
        })
    };

    let steps = match (cond.operator, cond.min, cond.max) {
        (_, None, None) => {
            return Err(SequenceError::InvalidCondition {
                sensor: cond.sensor.clone(),
                reason: "neither min nor max given".to_string(),
            })
        }
        (Some(op), Some(threshold), _) | (Some(op), None, Some(threshold)) => {
            vec![wait(op, threshold)?]
        }
        (None, min, max) => {
            let mut steps = Vec::new();
            if let Some(min) = min {
                steps.push(wait(Comparison::Ge, min)?);
            }
            if let Some(max) = max {
                steps.push(wait(Comparison::Le, max)?);
            }
            steps
        }
    };
    Ok(steps)
}

/// Compile every entry of sequence `name`.  The first failing entry aborts
/// compilation; the error names the sequence and the 1-based entry.
pub fn to_steps(
    name: &str,
    entries: &[SequenceEntry],
    ctx: &CompileContext,
) -> Result<Vec<SequenceStep>, SequenceError> {
    let mut steps = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        compile_entry(entry, ctx, &mut steps).map_err(|e| e.at(name, i + 1))?;
    }
    Ok(steps)
}

fn compile_entry(
    entry: &SequenceEntry,
    ctx: &CompileContext,
    out: &mut Vec<SequenceStep>,
) -> Result<(), SequenceError> {
    match entry {
        SequenceEntry::Command(command) => out.push(translate_command(command, ctx)?),
        SequenceEntry::Step(step) => out.push(step.clone()),
        SequenceEntry::Record(record) => {
            // Zero, negative and non-finite delays never become a wait.
            if record.delay.is_finite() && record.delay > 0.0 {
                out.push(SequenceStep::delay(record.delay.ceil() as u64));
            }
            for command in &record.commands {
                out.push(translate_command(command, ctx)?);
            }
            if let Some(cond) = &record.condition {
                out.extend(condition_steps(cond, ctx)?);
            }
        }
    }
    Ok(())
}
