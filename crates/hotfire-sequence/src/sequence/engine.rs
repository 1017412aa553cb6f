//! Sequence execution engine.
//!
//! Runs one validated sequence at a time.  Steps execute strictly in order;
//! cancellation is cooperative (checked at the top of every step and at each
//! poll of a wait), and an acknowledgment wait in progress is left to resolve
//! or time out on its own.

use crate::sequence::error::SequenceError;
use crate::sequence::events::SequenceEvent;
use crate::sequence::failsafe::Failsafe;
use crate::sequence::steps::{sleep_duration, to_steps, CompileContext};
use crate::sequence::telemetry::ValveState;
use hotfire_core::{SequenceStep, StationConfig, WaitCondition, EMERGENCY_SHUTDOWN};
use hotfire_safety::ValidatedSequences;
use hotfire_serial::{CommandLink, Heartbeat, HeartbeatControl, SendOptions};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const FALLBACK_POLL_MS: u64 = 50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Options / status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Interval of the run-owned heartbeat; 0 relies on the standing daemon.
    pub heartbeat_ms: u64,
    /// Poll interval for waits that do not name one.
    pub wait_poll_ms: u64,
    /// Run the failsafe procedure when a run fails or is cancelled.
    pub failsafe_on_error: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            heartbeat_ms: 0,
            wait_poll_ms: FALLBACK_POLL_MS,
            failsafe_on_error: true,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            heartbeat_ms: config.sequence_heartbeat_ms,
            wait_poll_ms: config.wait_poll_ms,
            failsafe_on_error: config.failsafe.on_sequence_error,
        }
    }
}

/// Snapshot of the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub running: bool,
    pub cancelled: bool,
    pub run_id: Option<Uuid>,
    pub sequence: Option<String>,
    /// 1-based index of the step executing.
    pub step: Option<usize>,
}

struct ActiveRun {
    run_id: Uuid,
    sequence: String,
    step: usize,
    cancel: CancellationToken,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SequenceEngine {
    link: Arc<dyn CommandLink>,
    failsafe: Arc<Failsafe>,
    heartbeat: Option<Arc<dyn HeartbeatControl>>,
    sequences: ValidatedSequences,
    ctx: CompileContext,
    options: EngineOptions,
    telemetry: Mutex<ValveState>,
    active: Mutex<Option<ActiveRun>>,
    idle: Notify,
    events: broadcast::Sender<SequenceEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SequenceEngine {
    /// Only validated sequences are accepted.  With a positive
    /// `sequenceHeartbeatMs`, every run owns a heartbeat on `link`.
    pub fn new(
        link: Arc<dyn CommandLink>,
        failsafe: Arc<Failsafe>,
        sequences: ValidatedSequences,
        config: &StationConfig,
    ) -> Self {
        let options = EngineOptions::from_config(config);
        let heartbeat = (options.heartbeat_ms > 0).then(|| {
            Arc::new(Heartbeat::new(
                link.clone(),
                Duration::from_millis(options.heartbeat_ms),
            )) as Arc<dyn HeartbeatControl>
        });
        let events = failsafe.event_sender();
        Self {
            link,
            failsafe,
            heartbeat,
            sequences,
            ctx: CompileContext::from_config(config),
            options,
            telemetry: Mutex::new(ValveState::new()),
            active: Mutex::new(None),
            idle: Notify::new(),
            events,
        }
    }

    /// Replace the run-owned heartbeat.
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatControl>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn failsafe(&self) -> &Arc<Failsafe> {
        &self.failsafe
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    pub fn sequence_names(&self) -> Vec<String> {
        self.sequences.names().map(str::to_string).collect()
    }

    pub fn compiled_steps(&self, name: &str) -> Result<Vec<SequenceStep>, SequenceError> {
        let entries = self
            .sequences
            .get(name)
            .ok_or_else(|| SequenceError::UnknownSequence(name.to_string()))?;
        to_steps(name, entries, &self.ctx)
    }

    pub fn run_state(&self) -> RunStatus {
        match lock(&self.active).as_ref() {
            Some(run) => RunStatus {
                running: true,
                cancelled: run.cancel.is_cancelled(),
                run_id: Some(run.run_id),
                sequence: Some(run.sequence.clone()),
                step: (run.step > 0).then_some(run.step),
            },
            None => RunStatus::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Request cancellation of the current run.  Returns `false` when idle.
    pub fn cancel(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(run) => {
                log::warn!("[seq:{}] cancel requested", run.sequence);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Feed one inbound line to the telemetry state.
    pub fn on_serial_data(&self, line: &str) {
        lock(&self.telemetry).ingest_line(line);
    }

    pub fn telemetry(&self) -> ValveState {
        lock(&self.telemetry).clone()
    }

    fn emit(&self, event: SequenceEvent) {
        let _ = self.events.send(event);
    }

    /// Claim the engine for `name`.  With `preempt`, a running sequence
    /// other than Emergency Shutdown is cancelled; the claim still fails
    /// until that run has exited.
    fn begin(
        &self,
        name: &str,
        preempt: bool,
    ) -> Result<(Uuid, CancellationToken), SequenceError> {
        let mut active = lock(&self.active);
        if let Some(run) = active.as_ref() {
            if preempt && run.sequence != EMERGENCY_SHUTDOWN && !run.cancel.is_cancelled() {
                log::warn!("[seq:{}] pre-empted by {}", run.sequence, name);
                run.cancel.cancel();
            }
            return Err(SequenceError::AlreadyRunning {
                running: run.sequence.clone(),
            });
        }
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            run_id,
            sequence: name.to_string(),
            step: 0,
            cancel: cancel.clone(),
        });
        Ok((run_id, cancel))
    }

    /// Emergency Shutdown bypasses the single-run gate: the active run is
    /// cancelled and the claim is retried once it has cleaned up.  A second
    /// Emergency Shutdown is refused like any other start.
    async fn take_over(&self) -> Result<(Uuid, CancellationToken), SequenceError> {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            match self.begin(EMERGENCY_SHUTDOWN, true) {
                Ok(claim) => return Ok(claim),
                Err(SequenceError::AlreadyRunning { running })
                    if running == EMERGENCY_SHUTDOWN =>
                {
                    return Err(SequenceError::AlreadyRunning { running });
                }
                Err(_) => idle.await,
            }
        }
    }

    fn mark_step(&self, step: usize) {
        if let Some(run) = lock(&self.active).as_mut() {
            run.step = step;
        }
    }

    /// Run sequence `name` to completion.  Only one sequence runs at a
    /// time; Emergency Shutdown cancels the active run and starts once it
    /// has exited.
    ///
    /// On failure or cancellation an `Error` event is published and, when
    /// configured, the failsafe runs before the error is returned.  Whatever
    /// the outcome, the run-owned heartbeat is stopped, every pending
    /// acknowledgment is failed with `sequence exit`, and the engine is idle
    /// again on return.
    pub async fn start(&self, name: &str) -> Result<(), SequenceError> {
        let steps = self.compiled_steps(name)?;
        let (run_id, cancel) = if name == EMERGENCY_SHUTDOWN {
            self.take_over().await?
        } else {
            self.begin(name, false)?
        };

        log::info!("[seq:{}] started ({} steps, run {})", name, steps.len(), run_id);
        self.emit(SequenceEvent::Started {
            sequence: name.to_string(),
            run_id,
            steps: steps.len(),
        });
        if let Some(hb) = &self.heartbeat {
            hb.start();
        }

        let result = self.execute(name, &steps, &cancel).await;

        match &result {
            Ok(()) => {
                log::info!("[seq:{}] completed", name);
                self.emit(SequenceEvent::Completed {
                    sequence: name.to_string(),
                });
            }
            Err(e) => {
                let step = match e {
                    SequenceError::Step { step, .. } => Some(*step),
                    _ => None,
                };
                log::error!("[seq:{}] {}", name, e);
                self.emit(SequenceEvent::Error {
                    sequence: name.to_string(),
                    step,
                    message: e.root().to_string(),
                });
                if self.options.failsafe_on_error {
                    self.failsafe
                        .try_fail_safe(&format!("sequence '{}' failed", name))
                        .await;
                }
            }
        }

        if let Some(hb) = &self.heartbeat {
            hb.stop();
        }
        self.link.abort_all_pendings("sequence exit").await;
        *lock(&self.active) = None;
        self.idle.notify_waiters();
        result
    }

    async fn execute(
        &self,
        name: &str,
        steps: &[SequenceStep],
        cancel: &CancellationToken,
    ) -> Result<(), SequenceError> {
        for (i, step) in steps.iter().enumerate() {
            let index = i + 1;
            if cancel.is_cancelled() {
                return Err(SequenceError::Cancelled.at(name, index));
            }
            self.mark_step(index);
            let description = step.describe();
            log::debug!("[seq:{}] step {}: {}", name, index, description);
            self.emit(SequenceEvent::StepStarted {
                sequence: name.to_string(),
                index,
                description,
            });
            self.run_step(step, cancel)
                .await
                .map_err(|e| e.at(name, index))?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &SequenceStep,
        cancel: &CancellationToken,
    ) -> Result<(), SequenceError> {
        match step {
            SequenceStep::Cmd {
                payload,
                ack_timeout_ms,
                feedback,
            } => {
                if let Some(pause) = sleep_duration(payload) {
                    return sleep_or_cancel(pause, cancel).await;
                }
                let opts = ack_timeout_ms
                    .map(SendOptions::with_ack_timeout)
                    .unwrap_or_default();
                self.link
                    .send(payload, opts)
                    .await
                    .map_err(|source| SequenceError::Send {
                        payload: payload.clone(),
                        source,
                    })?;

                if let Some(fb) = feedback {
                    let condition = WaitCondition::LimitSwitch {
                        valve_index: fb.valve_index,
                        state: fb.expected,
                    };
                    let met = self
                        .poll_until(&condition, fb.timeout_ms, fb.poll_ms, cancel)
                        .await?;
                    if !met {
                        return Err(SequenceError::FeedbackTimeout {
                            valve_index: fb.valve_index,
                            expected: fb.expected.label().to_string(),
                            timeout_ms: fb.timeout_ms,
                        });
                    }
                }
                Ok(())
            }
            SequenceStep::Wait {
                condition: WaitCondition::Time,
                timeout_ms,
                ..
            } => sleep_or_cancel(Duration::from_millis(*timeout_ms), cancel).await,
            SequenceStep::Wait {
                condition,
                timeout_ms,
                poll_ms,
            } => {
                if self.poll_until(condition, *timeout_ms, *poll_ms, cancel).await? {
                    Ok(())
                } else {
                    Err(SequenceError::WaitTimeout {
                        condition: describe_condition(condition),
                        timeout_ms: *timeout_ms,
                    })
                }
            }
        }
    }

    /// Poll `condition` until it holds (`Ok(true)`), the timeout elapses
    /// (`Ok(false)`), or the run is cancelled.
    async fn poll_until(
        &self,
        condition: &WaitCondition,
        timeout_ms: u64,
        poll_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, SequenceError> {
        let poll = match (poll_ms, self.options.wait_poll_ms) {
            (0, 0) => FALLBACK_POLL_MS,
            (0, default) => default,
            (explicit, _) => explicit,
        };
        let poll = Duration::from_millis(poll);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if lock(&self.telemetry).condition_met(condition) {
                return Ok(true);
            }
            if cancel.is_cancelled() {
                return Err(SequenceError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep_or_cancel(poll.min(deadline - now), cancel).await?;
        }
    }
}

async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), SequenceError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SequenceError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn describe_condition(condition: &WaitCondition) -> String {
    match condition {
        WaitCondition::Time => "time".to_string(),
        WaitCondition::LimitSwitch { valve_index, state } => {
            format!("V{} {}", valve_index, state.label())
        }
        WaitCondition::Pressure {
            sensor_index,
            operator,
            threshold_hundredths_psi,
        } => format!(
            "pt{} {} {:.2} psi",
            sensor_index,
            operator,
            *threshold_hundredths_psi as f64 / 100.0
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::failsafe::tests::{RecordingHeartbeat, RecordingLink};
    use crate::sequence::failsafe::{FailsafeOutcome, ValveRoles};
    use hotfire_core::{
        Comparison, ConditionDescriptor, SequenceEntry, SequenceMap, SequenceRecord,
        ValveMapping, EMERGENCY_SHUTDOWN,
    };
    use hotfire_safety::SafetyEngine;
    use std::sync::atomic::Ordering;

    struct Rig {
        engine: Arc<SequenceEngine>,
        link: Arc<RecordingLink>,
        daemon: Arc<RecordingHeartbeat>,
        run_hb: Arc<RecordingHeartbeat>,
    }

    fn cmd(c: &str) -> SequenceEntry {
        SequenceEntry::Command(c.to_string())
    }

    fn record(delay: f64, commands: &[&str]) -> SequenceEntry {
        SequenceEntry::Record(SequenceRecord {
            delay,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        })
    }

    fn config() -> StationConfig {
        let mut config = StationConfig::default();
        config.valve_mappings.insert(
            "Ethanol Main".into(),
            ValveMapping { servo_index: 0, feedback: false },
        );
        config.valve_mappings.insert(
            "N2O Main".into(),
            ValveMapping { servo_index: 1, feedback: true },
        );
        config.sensor_mappings.insert("Ox Tank".into(), 1);
        config.failsafe_roles.mains = vec![0, 1];
        config.failsafe_roles.vents = vec![2];
        config.feedback.timeout_ms = 500;
        config
    }

    fn rig(extra: Vec<(&str, Vec<SequenceEntry>)>) -> Rig {
        let config = config();
        let mut map = SequenceMap::new();
        map.insert(EMERGENCY_SHUTDOWN.to_string(), vec![cmd("V,0,C"), cmd("V,2,O")]);
        for (name, entries) in extra {
            map.insert(name.to_string(), entries);
        }
        let validated = SafetyEngine::new(map, &config.forbidden_pairs)
            .into_validated()
            .expect("sequences validate");

        let link = Arc::new(RecordingLink::default());
        let daemon = Arc::new(RecordingHeartbeat::default());
        let run_hb = Arc::new(RecordingHeartbeat::default());
        let failsafe = Arc::new(Failsafe::new(
            link.clone(),
            daemon.clone(),
            ValveRoles::from(&config.failsafe_roles),
            &config.failsafe,
        ));
        let engine = SequenceEngine::new(link.clone(), failsafe, validated, &config)
            .with_heartbeat(run_hb.clone());
        Rig {
            engine: Arc::new(engine),
            link,
            daemon,
            run_hb,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_steps_in_order() {
        let rig = rig(vec![(
            "Fill",
            vec![
                record(0.0, &["CMD,Ethanol Main,Open"]),
                record(250.0, &["CMD,Ethanol Main,Close", "V,5,O"]),
            ],
        )]);
        let mut events = rig.engine.subscribe();

        let started = Instant::now();
        rig.engine.start("Fill").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(300));

        assert_eq!(
            *rig.link.sends.lock().unwrap(),
            vec!["V,0,O", "V,0,C", "V,5,O"]
        );
        assert!(rig.link.writes.lock().unwrap().is_empty());
        assert_eq!(*rig.link.aborts.lock().unwrap(), vec!["all:sequence exit"]);
        assert_eq!(rig.run_hb.starts.load(Ordering::SeqCst), 1);
        assert_eq!(rig.run_hb.stops.load(Ordering::SeqCst), 1);
        assert!(!rig.engine.is_running());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(&seen[0], SequenceEvent::Started { steps: 4, .. }));
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, SequenceEvent::StepStarted { .. }))
                .count(),
            4
        );
        assert_eq!(
            seen.last(),
            Some(&SequenceEvent::Completed { sequence: "Fill".into() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_token_is_not_transmitted() {
        let rig = rig(vec![("Pause", vec![cmd("sleep 300ms"), cmd("V,3,O")])]);
        let started = Instant::now();
        rig.engine.start("Pause").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(350));
        assert_eq!(*rig.link.sends.lock().unwrap(), vec!["V,3,O"]);
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let rig = rig(vec![]);
        let err = rig.engine.start("Nope").await.unwrap_err();
        assert_eq!(err, SequenceError::UnknownSequence("Nope".into()));
        assert!(rig.link.aborts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_refused() {
        let rig = rig(vec![
            ("Long", vec![record(10_000.0, &["V,3,O"])]),
            ("Fill", vec![cmd("V,4,O")]),
        ]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.start("Long").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = rig.engine.run_state();
        assert!(status.running);
        assert_eq!(status.sequence.as_deref(), Some("Long"));
        assert_eq!(status.step, Some(1));

        for name in ["Fill", "Long"] {
            let err = rig.engine.start(name).await.unwrap_err();
            assert_eq!(err, SequenceError::AlreadyRunning { running: "Long".into() });
        }
        assert!(!rig.engine.run_state().cancelled);

        run.await.unwrap().unwrap();
        assert!(!rig.engine.is_running());
        assert!(!rig.link.sends.lock().unwrap().contains(&"V,4,O".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_shutdown_preempts_running_sequence() {
        let rig = rig(vec![("Long", vec![record(10_000.0, &["V,3,O"])])]);
        let mut events = rig.engine.subscribe();
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.start("Long").await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        rig.engine.start(EMERGENCY_SHUTDOWN).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1_000));

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.root(), &SequenceError::Cancelled);
        assert!(!rig.engine.is_running());

        let sends = rig.link.sends.lock().unwrap().clone();
        assert!(!sends.contains(&"V,3,O".to_string()));
        assert_eq!(&sends[sends.len() - 2..], ["V,0,C", "V,2,O"]);

        let mut order = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SequenceEvent::Started { sequence, .. } => {
                    order.push(format!("start:{}", sequence))
                }
                SequenceEvent::Error { sequence, .. } => {
                    order.push(format!("error:{}", sequence))
                }
                SequenceEvent::Completed { sequence } => {
                    order.push(format!("done:{}", sequence))
                }
                _ => {}
            }
        }
        assert_eq!(
            order,
            vec![
                "start:Long",
                "error:Long",
                "start:Emergency Shutdown",
                "done:Emergency Shutdown",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_shutdown_does_not_preempt_itself() {
        let mut rig = rig(vec![]);
        let slow = vec![record(5_000.0, &["V,0,C"]), cmd("V,2,O")];
        let config = config();
        let mut map = SequenceMap::new();
        map.insert(EMERGENCY_SHUTDOWN.to_string(), slow);
        let validated = SafetyEngine::new(map, &config.forbidden_pairs)
            .into_validated()
            .expect("sequences validate");
        let failsafe = rig.engine.failsafe().clone();
        rig.engine = Arc::new(SequenceEngine::new(
            rig.link.clone(),
            failsafe,
            validated,
            &config,
        ));

        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.start(EMERGENCY_SHUTDOWN).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = rig.engine.start(EMERGENCY_SHUTDOWN).await.unwrap_err();
        assert_eq!(
            err,
            SequenceError::AlreadyRunning { running: EMERGENCY_SHUTDOWN.into() }
        );
        assert!(!rig.engine.run_state().cancelled);
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_triggers_failsafe_and_resets() {
        let rig = rig(vec![("Long", vec![record(10_000.0, &["V,3,O"])])]);
        let mut events = rig.engine.subscribe();
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.start("Long").await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(rig.engine.cancel());
        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.root(), &SequenceError::Cancelled);
        assert!(matches!(err, SequenceError::Step { step: 1, .. }));

        // Failsafe: close mains, open vents, both passes.
        assert_eq!(
            *rig.link.writes.lock().unwrap(),
            vec!["V,0,C", "V,1,C", "V,2,O"]
        );
        assert!(!rig.link.sends.lock().unwrap().contains(&"V,3,O".to_string()));
        assert!(rig.daemon.stops.load(Ordering::SeqCst) >= 1);
        assert_eq!(*rig.link.aborts.lock().unwrap(), vec!["all:sequence exit"]);
        assert!(!rig.engine.cancel());

        let mut saw_error = false;
        let mut saw_failsafe = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SequenceEvent::Error { step, message, .. } => {
                    assert_eq!(step, Some(1));
                    assert_eq!(message, "cancelled");
                    saw_error = true;
                }
                SequenceEvent::Failsafe { outcome, .. } => {
                    assert!(matches!(outcome, FailsafeOutcome::Executed { .. }));
                    saw_failsafe = true;
                }
                _ => {}
            }
        }
        assert!(saw_error && saw_failsafe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pressure_wait_completes_on_telemetry() {
        let entry = SequenceEntry::Record(SequenceRecord {
            commands: vec!["V,4,O".into()],
            condition: Some(ConditionDescriptor {
                sensor: "Ox Tank".into(),
                min: Some(450.0),
                max: None,
                operator: Some(Comparison::Ge),
                timeout_ms: Some(5_000),
            }),
            ..Default::default()
        });
        let rig = rig(vec![("Press", vec![entry, cmd("V,4,C")])]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.start("Press").await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.engine.on_serial_data("pt1:300.0");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rig.engine.is_running());
        rig.engine.on_serial_data("pt1:451.5,pt2:10");

        run.await.unwrap().unwrap();
        assert_eq!(*rig.link.sends.lock().unwrap(), vec!["V,4,O", "V,4,C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_timeout_fails_run() {
        let rig = rig(vec![("Ox", vec![cmd("CMD,N2O Main,Open")])]);
        let started = Instant::now();
        let err = rig.engine.start("Ox").await.unwrap_err();
        assert_eq!(
            err.root(),
            &SequenceError::FeedbackTimeout {
                valve_index: 1,
                expected: "OPEN".into(),
                timeout_ms: 500,
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(rig.link.writes.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_confirmed_by_limit_switch() {
        let rig = rig(vec![("Ox", vec![cmd("CMD,N2O Main,Open")])]);
        rig.engine.on_serial_data("V1_LS_OPEN:1,V1_LS_CLOSED:0");
        rig.engine.start("Ox").await.unwrap();
        assert_eq!(*rig.link.sends.lock().unwrap(), vec!["V,1,O"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_without_failsafe() {
        let rig = rig(vec![("Fill", vec![cmd("V,3,O")])]);
        rig.link.fail_sends.store(true, Ordering::SeqCst);
        let engine = Arc::try_unwrap(rig.engine)
            .ok()
            .unwrap()
            .with_options(EngineOptions {
                failsafe_on_error: false,
                ..EngineOptions::default()
            });
        let err = engine.start("Fill").await.unwrap_err();
        assert!(matches!(err.root(), SequenceError::Send { payload, .. } if payload == "V,3,O"));
        assert!(rig.link.writes.lock().unwrap().is_empty());
    }
}
