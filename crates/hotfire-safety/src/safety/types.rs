//! Forbidden pairs, violations and the safety report.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Forbidden pair
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Two valves that must never be OPEN at the same time.  Unordered:
/// `(A, B)` and `(B, A)` are the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForbiddenPair {
    pub first: String,
    pub second: String,
}

impl ForbiddenPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// Normalise a config table, dropping duplicates and self-pairs.
    pub fn from_table(pairs: &[(String, String)]) -> Vec<Self> {
        let mut seen = HashSet::new();
        pairs
            .iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| Self::new(a.as_str(), b.as_str()))
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    pub fn both(&self, is_open: impl Fn(&str) -> bool) -> bool {
        is_open(&self.first) && is_open(&self.second)
    }
}

impl fmt::Display for ForbiddenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} and {}", self.first, self.second)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Violations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViolationKind {
    /// Structural or semantic problem in the definitions.
    Schema,
    /// Both members of a forbidden pair opened in one step.
    Static,
    /// Both members of a forbidden pair OPEN at some point of the timeline.
    Dynamic,
}

impl ViolationKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    /// `None` for set-level problems (e.g. a missing required sequence).
    pub sequence: Option<String>,
    /// 1-based step index.
    pub step: Option<usize>,
    /// Sum of the delays of the steps before `step` (dry run only).
    pub elapsed_ms: Option<f64>,
    pub pair: Option<ForbiddenPair>,
    pub message: String,
}

impl Violation {
    pub fn schema(sequence: Option<&str>, step: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::Schema,
            sequence: sequence.map(str::to_string),
            step,
            elapsed_ms: None,
            pair: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind.label())?;
        if let Some(seq) = &self.sequence {
            write!(f, " '{}'", seq)?;
        }
        if let Some(step) = self.step {
            write!(f, " step {}", step)?;
        }
        if let Some(ms) = self.elapsed_ms {
            write!(f, " @ {}ms", ms)?;
        }
        write!(f, ": {}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a full validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

impl SafetyReport {
    pub fn new(violations: Vec<Violation>, warnings: Vec<String>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
            warnings,
        }
    }

    pub fn of_kind(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }

    pub fn summary(&self) -> String {
        if self.valid {
            return format!("valid ({} warnings)", self.warnings.len());
        }
        let count = |k| self.of_kind(k).count();
        format!(
            "{} schema, {} static, {} dynamic violations",
            count(ViolationKind::Schema),
            count(ViolationKind::Static),
            count(ViolationKind::Dynamic)
        )
    }
}
