//! Safety engine and the validated-sequences gate.

use crate::safety::checks;
use crate::safety::error::SafetyError;
use crate::safety::types::{ForbiddenPair, SafetyReport, Violation};
use hotfire_core::{
    load_sequences, SequenceEntry, SequenceMap, StationConfig, ValveMappings, EMERGENCY_SHUTDOWN,
};
use std::path::Path;

pub struct SafetyEngine {
    sequences: SequenceMap,
    pairs: Vec<ForbiddenPair>,
    valves: Option<ValveMappings>,
}

impl SafetyEngine {
    pub fn new(sequences: SequenceMap, forbidden_pairs: &[(String, String)]) -> Self {
        Self {
            sequences,
            pairs: ForbiddenPair::from_table(forbidden_pairs),
            valves: None,
        }
    }

    /// Also reject named commands for valves absent from `valves`.
    pub fn with_valve_mappings(mut self, valves: ValveMappings) -> Self {
        self.valves = Some(valves);
        self
    }

    /// Load a sequence file and take the pair table and valve mappings
    /// from the station config.
    pub fn load(path: &Path, config: &StationConfig) -> Result<Self, SafetyError> {
        let sequences = load_sequences(path)?;
        Ok(Self::new(sequences, &config.forbidden_pairs)
            .with_valve_mappings(config.valve_mappings.clone()))
    }

    pub fn sequences(&self) -> &SequenceMap {
        &self.sequences
    }

    pub fn forbidden_pairs(&self) -> &[ForbiddenPair] {
        &self.pairs
    }

    /// Sequences subject to the forbidden-pair checks.  Emergency Shutdown
    /// is the designated exit path and may legitimately open vent and
    /// purge together.
    fn checked(&self) -> impl Iterator<Item = (&String, &Vec<SequenceEntry>)> {
        self.sequences
            .iter()
            .filter(|(name, _)| name.as_str() != EMERGENCY_SHUTDOWN)
    }

    pub fn schema_check(&self) -> (Vec<Violation>, Vec<String>) {
        checks::schema_check(&self.sequences, self.valves.as_ref())
    }

    pub fn static_check(&self) -> Vec<Violation> {
        self.checked()
            .flat_map(|(name, entries)| checks::static_check(name, entries, &self.pairs))
            .collect()
    }

    pub fn dry_run_sequence(&self, name: &str) -> Result<Vec<Violation>, SafetyError> {
        let entries = self
            .sequences
            .get(name)
            .ok_or_else(|| SafetyError::UnknownSequence(name.to_string()))?;
        Ok(checks::dry_run(name, entries, &self.pairs))
    }

    pub fn dry_run_all(&self) -> Vec<Violation> {
        self.checked()
            .flat_map(|(name, entries)| checks::dry_run(name, entries, &self.pairs))
            .collect()
    }

    /// Run every check.
    pub fn validate(&self) -> SafetyReport {
        let (mut violations, warnings) = self.schema_check();
        violations.extend(self.static_check());
        violations.extend(self.dry_run_all());

        for v in &violations {
            log::error!("[safety] {}", v);
        }
        for w in &warnings {
            log::warn!("[safety] {}", w);
        }
        let report = SafetyReport::new(violations, warnings);
        log::info!(
            "[safety] {} sequences checked: {}",
            self.sequences.len(),
            report.summary()
        );
        report
    }

    /// Pass the gate.  Fails with the full report when anything is wrong;
    /// no sequence of an invalid set is released.
    pub fn into_validated(self) -> Result<ValidatedSequences, SafetyError> {
        let report = self.validate();
        if !report.valid {
            return Err(SafetyError::Invalid(report));
        }
        Ok(ValidatedSequences {
            sequences: self.sequences,
            report,
        })
    }
}

/// A sequence set that passed every safety check.  Only obtainable from
/// [`SafetyEngine::into_validated`].
#[derive(Debug, Clone)]
pub struct ValidatedSequences {
    sequences: SequenceMap,
    report: SafetyReport,
}

impl ValidatedSequences {
    pub fn get(&self, name: &str) -> Option<&[SequenceEntry]> {
        self.sequences.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sequences.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Report of the passing validation (warnings only).
    pub fn report(&self) -> &SafetyReport {
        &self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::types::ViolationKind;
    use hotfire_core::default_forbidden_pairs;
    use std::io::Write;

    const SEQUENCES: &str = r#"{
        "Emergency Shutdown": [
            { "message": "Safe", "delay": 0,
              "commands": ["CMD,Ethanol Main,Close", "CMD,N2O Main,Close",
                           "CMD,System Vent,Open", "CMD,Nitrogen Purge,Open"] }
        ],
        "Hotfire": [
            { "message": "Close vent", "delay": 0, "commands": ["CMD,System Vent,Close"] },
            { "message": "Open mains", "delay": 2000,
              "commands": ["CMD,Ethanol Main,Open", "CMD,N2O Main,Open"] },
            { "message": "Close mains", "delay": 3000,
              "commands": ["CMD,Ethanol Main,Close", "CMD,N2O Main,Close"] }
        ]
    }"#;

    fn engine(json: &str) -> SafetyEngine {
        let map: SequenceMap = serde_json::from_str(json).unwrap();
        SafetyEngine::new(map, &default_forbidden_pairs())
    }

    #[test]
    fn test_clean_set_passes_gate() {
        let validated = engine(SEQUENCES).into_validated().unwrap();
        assert_eq!(validated.len(), 2);
        assert!(validated.contains("Hotfire"));
        assert_eq!(validated.get("Hotfire").map(|s| s.len()), Some(3));
        assert!(validated.report().valid);
    }

    #[test]
    fn test_emergency_shutdown_is_exempt() {
        let e = engine(SEQUENCES);
        assert!(e.static_check().is_empty());
        assert!(e.dry_run_all().is_empty());
        // Directly dry-running it still reports what it does.
        assert!(!e.dry_run_sequence(EMERGENCY_SHUTDOWN).unwrap().is_empty());
    }

    #[test]
    fn test_one_bad_sequence_blocks_everything() {
        let e = engine(
            r#"{
                "Emergency Shutdown": [ { "commands": ["CMD,System Vent,Open"] } ],
                "Fine": [ { "commands": ["CMD,Ethanol Main,Open"] } ],
                "Bad": [
                    { "delay": 500, "commands": ["CMD,N2O Main,Open"] },
                    { "delay": 0, "commands": ["CMD,System Vent,Open"] }
                ]
            }"#,
        );
        let report = e.validate();
        assert!(!report.valid);
        let dynamic: Vec<_> = report.of_kind(ViolationKind::Dynamic).collect();
        assert_eq!(dynamic.len(), 1);
        assert_eq!(dynamic[0].sequence.as_deref(), Some("Bad"));
        assert_eq!(dynamic[0].step, Some(2));
        assert_eq!(dynamic[0].elapsed_ms, Some(500.0));

        match e.into_validated() {
            Err(SafetyError::Invalid(report)) => assert!(!report.valid),
            other => panic!("expected Invalid, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_missing_emergency_shutdown_is_fatal() {
        let e = engine(r#"{ "Hotfire": [ "V,1,O" ] }"#);
        let err = e.into_validated().unwrap_err();
        assert!(err.to_string().contains("1 schema"));
    }

    #[test]
    fn test_unknown_sequence() {
        let e = engine(SEQUENCES);
        assert!(matches!(
            e.dry_run_sequence("Nope"),
            Err(SafetyError::UnknownSequence(name)) if name == "Nope"
        ));
    }

    #[test]
    fn test_load_uses_config_mappings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SEQUENCES).unwrap();
        // No valve mappings configured: every named valve is unknown.
        let cfg = StationConfig::default();
        let report = SafetyEngine::load(file.path(), &cfg).unwrap().validate();
        assert!(!report.valid);
        assert!(report
            .of_kind(ViolationKind::Schema)
            .all(|v| v.message.contains("unknown valve")));
    }
}
