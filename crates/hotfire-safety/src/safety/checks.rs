//! The three checks: schema, same-step (static) and timeline (dry run).
//!
//! All three work on named `CMD,<Valve>,(Open|Close)` commands.  Raw
//! `V,<idx>,<O|C>` commands carry no valve name and are not tracked; the
//! schema pass reports them as warnings so the gap is visible.

use crate::safety::types::{ForbiddenPair, Violation, ViolationKind};
use hotfire_core::{
    parse_valve_command, SequenceEntry, SequenceMap, SequenceStep, ValveAction, ValveCommand,
    ValveMappings, WaitCondition, EMERGENCY_SHUTDOWN,
};
use std::collections::{HashMap, HashSet};

/// First comma-separated field is `V` or `CMD`.
fn is_valve_like(command: &str) -> bool {
    matches!(command.trim().split(',').next().map(str::trim), Some("V" | "CMD"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structural and semantic checks.  Returns `(violations, warnings)`.
///
/// With `valves` supplied, a named command for an unmapped valve is a
/// violation.
pub fn schema_check(
    sequences: &SequenceMap,
    valves: Option<&ValveMappings>,
) -> (Vec<Violation>, Vec<String>) {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    if !sequences.contains_key(EMERGENCY_SHUTDOWN) {
        violations.push(Violation::schema(
            None,
            None,
            format!("required sequence '{}' is missing", EMERGENCY_SHUTDOWN),
        ));
    }

    for (name, entries) in sequences {
        let seq = Some(name.as_str());
        if name.trim().is_empty() {
            violations.push(Violation::schema(seq, None, "sequence name is empty"));
        }
        if entries.is_empty() {
            violations.push(Violation::schema(seq, None, "sequence has no steps"));
        }

        for (i, entry) in entries.iter().enumerate() {
            let step = Some(i + 1);

            match entry {
                SequenceEntry::Record(record) => {
                    if !record.delay.is_finite() {
                        violations.push(Violation::schema(seq, step, "delay is not a finite number"));
                    }
                    if let Some(cond) = &record.condition {
                        if cond.sensor.trim().is_empty() {
                            violations.push(Violation::schema(seq, step, "condition has no sensor"));
                        }
                        let bounds = [cond.min, cond.max];
                        if bounds.iter().flatten().any(|v| !v.is_finite()) {
                            violations.push(Violation::schema(
                                seq,
                                step,
                                format!("condition on '{}' has a non-finite bound", cond.sensor),
                            ));
                        }
                        if cond.min.is_none() && cond.max.is_none() {
                            violations.push(Violation::schema(
                                seq,
                                step,
                                format!("condition on '{}' has neither min nor max", cond.sensor),
                            ));
                        }
                    }
                }
                SequenceEntry::Step(SequenceStep::Wait { timeout_ms: 0, condition, .. })
                    if *condition != WaitCondition::Time =>
                {
                    warnings.push(format!(
                        "'{}' step {}: condition wait with a zero timeout always fails",
                        name,
                        i + 1
                    ));
                }
                _ => {}
            }

            for command in entry.commands() {
                if command.trim().is_empty() {
                    violations.push(Violation::schema(seq, step, "empty command"));
                    continue;
                }
                match parse_valve_command(command) {
                    Some(ValveCommand::Named { valve, .. }) => {
                        if let Some(map) = valves {
                            if !map.contains_key(valve) {
                                violations.push(Violation::schema(
                                    seq,
                                    step,
                                    format!("unknown valve '{}' in '{}'", valve, command),
                                ));
                            }
                        }
                    }
                    Some(ValveCommand::Raw { .. }) => warnings.push(format!(
                        "'{}' step {}: raw command '{}' is not tracked by the dry run",
                        name,
                        i + 1,
                        command
                    )),
                    None if is_valve_like(command) => {
                        violations.push(Violation::schema(
                            seq,
                            step,
                            format!("malformed valve command '{}'", command),
                        ));
                    }
                    None => {}
                }
            }
        }
    }

    (violations, warnings)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Static (same step)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Valves a single entry commands OPEN.
fn opened_in(entry: &SequenceEntry) -> HashSet<&str> {
    entry
        .commands()
        .into_iter()
        .filter_map(|c| match parse_valve_command(c) {
            Some(ValveCommand::Named {
                valve,
                action: ValveAction::Open,
            }) => Some(valve),
            _ => None,
        })
        .collect()
}

pub fn static_check(name: &str, entries: &[SequenceEntry], pairs: &[ForbiddenPair]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let opened = opened_in(entry);
        if opened.len() < 2 {
            continue;
        }
        for pair in pairs {
            if pair.both(|v| opened.contains(v)) {
                violations.push(Violation {
                    kind: ViolationKind::Static,
                    sequence: Some(name.to_string()),
                    step: Some(i + 1),
                    elapsed_ms: None,
                    pair: Some(pair.clone()),
                    message: format!("{} opened in the same step", pair),
                });
            }
        }
    }
    violations
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Dynamic (dry run)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replay `entries` against an inferred valve-state map.
///
/// A violation is recorded when a pair *becomes* simultaneously OPEN; it
/// is recorded again only after the pair has left that state.  Unknown or
/// malformed commands are skipped.
pub fn dry_run(name: &str, entries: &[SequenceEntry], pairs: &[ForbiddenPair]) -> Vec<Violation> {
    let mut open: HashMap<&str, bool> = HashMap::new();
    let mut active: HashSet<&ForbiddenPair> = HashSet::new();
    let mut violations = Vec::new();
    let mut elapsed_ms = 0.0;

    for (i, entry) in entries.iter().enumerate() {
        for command in entry.commands() {
            if let Some(ValveCommand::Named { valve, action }) = parse_valve_command(command) {
                open.insert(valve, action == ValveAction::Open);
            }
        }

        for pair in pairs {
            if pair.both(|v| open.get(v).copied().unwrap_or(false)) {
                if active.insert(pair) {
                    violations.push(Violation {
                        kind: ViolationKind::Dynamic,
                        sequence: Some(name.to_string()),
                        step: Some(i + 1),
                        elapsed_ms: Some(elapsed_ms),
                        pair: Some(pair.clone()),
                        message: format!("{} both OPEN", pair),
                    });
                }
            } else {
                active.remove(pair);
            }
        }

        elapsed_ms += entry.delay_ms();
    }
    violations
}
