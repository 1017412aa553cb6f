//! Failsafe procedure.
//!
//! Closes every main valve and opens every vent and purge.  Admission is
//! guarded by a latch and a cooldown:
//!
//! - a call while a run is executing, or while the latch is held, is refused
//! - a call within `cooldown` of the previous run is refused
//! - at completion the latch stays held iff an emergency is still active;
//!   clearing the emergency releases it
//!
//! An admitted run first writes every command unframed (`write_now`), so
//! actuation starts even if acknowledgment handling stalls, then sends the
//! same commands through the acknowledged path concurrently.  Failures are
//! logged, never returned.  The heartbeat is stopped on every call.

use crate::sequence::events::SequenceEvent;
use futures::future::join_all;
use hotfire_core::{raw_valve_command, FailsafeRoles, FailsafeSettings, ValveAction};
use hotfire_serial::{CommandLink, HeartbeatControl, SendOptions};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Deduplicated servo indices per failsafe role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValveRoles {
    pub mains: Vec<u16>,
    pub vents: Vec<u16>,
    pub purges: Vec<u16>,
}

fn dedup(indices: &[u16]) -> Vec<u16> {
    let mut out: Vec<u16> = Vec::with_capacity(indices.len());
    for idx in indices {
        if !out.contains(idx) {
            out.push(*idx);
        }
    }
    out
}

impl ValveRoles {
    pub fn new(mains: &[u16], vents: &[u16], purges: &[u16]) -> Self {
        Self {
            mains: dedup(mains),
            vents: dedup(vents),
            purges: dedup(purges),
        }
    }

    /// Close mains, open vents, open purges.
    pub fn commands(&self) -> Vec<String> {
        let close = self
            .mains
            .iter()
            .map(|i| raw_valve_command(*i, ValveAction::Close));
        let open = self
            .vents
            .iter()
            .chain(&self.purges)
            .map(|i| raw_valve_command(*i, ValveAction::Open));
        close.chain(open).collect()
    }
}

impl From<&FailsafeRoles> for ValveRoles {
    fn from(roles: &FailsafeRoles) -> Self {
        Self::new(&roles.mains, &roles.vents, &roles.purges)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "result")]
pub enum FailsafeOutcome {
    Executed {
        commands: usize,
        write_failures: usize,
        ack_failures: usize,
    },
    /// Refused: a run is executing or the latch is held.
    Latched,
    /// Refused: the previous run was less than the cooldown ago.
    CoolingDown,
}

impl FailsafeOutcome {
    pub fn executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }
}

#[derive(Debug, Default)]
struct FailsafeState {
    running: bool,
    latched: bool,
    emergency_active: bool,
    last_failsafe_at: Option<Instant>,
}

/// Snapshot of the failsafe gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailsafeStatus {
    pub in_failsafe: bool,
    pub emergency_active: bool,
    pub since_last_ms: Option<u64>,
}

pub struct Failsafe {
    link: Arc<dyn CommandLink>,
    heartbeat: Arc<dyn HeartbeatControl>,
    roles: ValveRoles,
    cooldown: Duration,
    ack_timeout_ms: u64,
    state: Mutex<FailsafeState>,
    events: broadcast::Sender<SequenceEvent>,
}

impl Failsafe {
    pub fn new(
        link: Arc<dyn CommandLink>,
        heartbeat: Arc<dyn HeartbeatControl>,
        roles: ValveRoles,
        settings: &FailsafeSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            link,
            heartbeat,
            roles,
            cooldown: Duration::from_millis(settings.cooldown_ms),
            ack_timeout_ms: settings.ack_timeout_ms,
            state: Mutex::new(FailsafeState::default()),
            events,
        }
    }

    pub fn roles(&self) -> &ValveRoles {
        &self.roles
    }

    /// Event channel shared with the sequence engine.
    pub fn event_sender(&self) -> broadcast::Sender<SequenceEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FailsafeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// External emergency signal.  Clearing it releases a held latch.
    pub fn set_emergency_active(&self, active: bool) {
        let mut state = self.lock();
        state.emergency_active = active;
        if !active && state.latched {
            state.latched = false;
            log::info!("[failsafe] emergency cleared, latch released");
        }
    }

    pub fn state(&self) -> FailsafeStatus {
        let state = self.lock();
        FailsafeStatus {
            in_failsafe: state.running || state.latched,
            emergency_active: state.emergency_active,
            since_last_ms: state
                .last_failsafe_at
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    fn admit(&self) -> Option<FailsafeOutcome> {
        let mut state = self.lock();
        if state.running || state.latched {
            return Some(FailsafeOutcome::Latched);
        }
        if let Some(last) = state.last_failsafe_at {
            if last.elapsed() < self.cooldown {
                return Some(FailsafeOutcome::CoolingDown);
            }
        }
        state.running = true;
        state.last_failsafe_at = Some(Instant::now());
        None
    }

    pub async fn try_fail_safe(&self, tag: &str) -> FailsafeOutcome {
        if let Some(refused) = self.admit() {
            log::debug!("[failsafe] '{}' refused: {:?}", tag, refused);
            self.heartbeat.stop();
            return refused;
        }

        let commands = self.roles.commands();
        log::warn!("[failsafe] executing ({}): {}", tag, commands.join(" "));

        let mut write_failures = 0;
        for cmd in &commands {
            if let Err(e) = self.link.write_now(cmd).await {
                write_failures += 1;
                log::warn!("[failsafe] direct write of '{}' failed: {}", cmd, e);
            }
        }

        let opts = SendOptions {
            max_retries: Some(1),
            ..SendOptions::with_ack_timeout(self.ack_timeout_ms)
        };
        let results = join_all(commands.iter().map(|cmd| self.link.send(cmd, opts))).await;
        let mut ack_failures = 0;
        for (cmd, result) in commands.iter().zip(results) {
            if let Err(e) = result {
                ack_failures += 1;
                log::warn!("[failsafe] acknowledged '{}' failed: {}", cmd, e);
            }
        }

        let latched = {
            let mut state = self.lock();
            state.running = false;
            state.last_failsafe_at = Some(Instant::now());
            state.latched = state.emergency_active;
            state.latched
        };
        self.heartbeat.stop();

        let outcome = FailsafeOutcome::Executed {
            commands: commands.len(),
            write_failures,
            ack_failures,
        };
        log::warn!(
            "[failsafe] done ({}): {} commands, {} write / {} ack failures{}",
            tag,
            commands.len(),
            write_failures,
            ack_failures,
            if latched { ", latched" } else { "" }
        );
        let _ = self.events.send(SequenceEvent::Failsafe {
            tag: tag.to_string(),
            outcome,
        });
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hotfire_serial::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every call; sends resolve immediately unless `fail_sends`.
    #[derive(Default)]
    pub(crate) struct RecordingLink {
        pub writes: Mutex<Vec<String>>,
        pub sends: Mutex<Vec<String>>,
        pub clears: AtomicUsize,
        pub aborts: Mutex<Vec<String>>,
        pub fail_sends: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl CommandLink for RecordingLink {
        async fn send(&self, payload: &str, _opts: SendOptions) -> Result<(), TransportError> {
            self.sends.lock().unwrap().push(payload.to_string());
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::AckTimeout {
                    payload: payload.to_string(),
                    attempts: 1,
                });
            }
            Ok(())
        }
        async fn write_now(&self, payload: &str) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push(payload.to_string());
            Ok(())
        }
        async fn clear_queue(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
        async fn abort_inflight(&self, reason: &str) {
            self.aborts.lock().unwrap().push(format!("inflight:{}", reason));
        }
        async fn abort_all_pendings(&self, reason: &str) {
            self.aborts.lock().unwrap().push(format!("all:{}", reason));
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingHeartbeat {
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub running: std::sync::atomic::AtomicBool,
    }

    impl HeartbeatControl for RecordingHeartbeat {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn failsafe(
        roles: ValveRoles,
    ) -> (Failsafe, Arc<RecordingLink>, Arc<RecordingHeartbeat>) {
        let link = Arc::new(RecordingLink::default());
        let hb = Arc::new(RecordingHeartbeat::default());
        let fs = Failsafe::new(link.clone(), hb.clone(), roles, &FailsafeSettings::default());
        (fs, link, hb)
    }

    #[test]
    fn test_roles_dedup_and_order() {
        let roles = ValveRoles::new(&[1, 0, 1], &[2, 2], &[3, 3, 3]);
        assert_eq!(roles.commands(), vec!["V,1,C", "V,0,C", "V,2,O", "V,3,O"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_calls_execute_once() {
        let (fs, link, hb) = failsafe(ValveRoles::new(&[0, 1, 0], &[2, 2], &[3]));
        let mut executed = 0;
        for _ in 0..10 {
            if fs.try_fail_safe("test").await.executed() {
                executed += 1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executed, 1);

        let writes = link.writes.lock().unwrap().clone();
        assert_eq!(writes, vec!["V,0,C", "V,1,C", "V,2,O", "V,3,O"]);
        let mut sends = link.sends.lock().unwrap().clone();
        sends.sort();
        assert_eq!(sends, vec!["V,0,C", "V,1,C", "V,2,O", "V,3,O"]);
        // Stopped on every call, admitted or not.
        assert_eq!(hb.stops.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latch_holds_while_emergency_active() {
        let (fs, link, _hb) = failsafe(ValveRoles::new(&[0], &[1], &[]));
        fs.set_emergency_active(true);
        assert!(fs.try_fail_safe("emergency").await.executed());
        assert!(fs.state().in_failsafe);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fs.try_fail_safe("again").await, FailsafeOutcome::Latched);
        assert!(fs.state().in_failsafe);

        fs.set_emergency_active(false);
        assert!(!fs.state().in_failsafe);
        assert!(fs.try_fail_safe("after clear").await.executed());
        assert!(!fs.state().in_failsafe);
        assert_eq!(link.writes.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let (fs, _link, _hb) = failsafe(ValveRoles::new(&[0], &[], &[]));
        assert!(fs.try_fail_safe("a").await.executed());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fs.try_fail_safe("b").await, FailsafeOutcome::CoolingDown);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(fs.try_fail_safe("c").await.executed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_failures_are_counted_not_raised() {
        let (fs, link, _hb) = failsafe(ValveRoles::new(&[0], &[1], &[2]));
        link.fail_sends.store(true, Ordering::SeqCst);
        let mut events = fs.subscribe();
        let outcome = fs.try_fail_safe("link down").await;
        assert_eq!(
            outcome,
            FailsafeOutcome::Executed {
                commands: 3,
                write_failures: 0,
                ack_failures: 3
            }
        );
        match events.recv().await.unwrap() {
            SequenceEvent::Failsafe { tag, outcome: o } => {
                assert_eq!(tag, "link down");
                assert_eq!(o, outcome);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
