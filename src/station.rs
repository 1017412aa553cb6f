//! Station wiring and the inbound-line call site.
//!
//! One `Station` owns the link, the standing heartbeat daemon, the failsafe
//! and the sequence engine.  Inbound lines are routed here:
//!
//! - `EMERG…` halts all outbound traffic (queue cleared, in-flight and
//!   pending acknowledgments aborted), stops the heartbeat, latches the
//!   failsafe and cancels the running sequence
//! - `EMERG_CLEARED` releases the latch and restarts the heartbeat; a
//!   sequence is never resumed automatically
//! - telemetry feeds the sequence engine's valve state

use crate::error::StationError;
use hotfire_core::StationConfig;
use hotfire_safety::ValidatedSequences;
use hotfire_sequence::{Failsafe, FailsafeOutcome, SequenceEngine, ValveRoles};
use hotfire_serial::codec::{self, InboundLine};
use hotfire_serial::{
    CommandLink, Heartbeat, HeartbeatControl, LinkTransport, ProtocolEngine, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const EMERGENCY_REASON: &str = "emergency";

/// What [`Station::handle_line`] did with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    Emergency,
    EmergencyCleared,
    Telemetry,
    /// Acknowledgments, gate signals, other state markers and malformed
    /// lines; logged only.
    Ignored,
}

pub struct Station {
    config: StationConfig,
    engine: Option<ProtocolEngine>,
    link: Arc<dyn CommandLink>,
    heartbeat: Arc<dyn HeartbeatControl>,
    failsafe: Arc<Failsafe>,
    sequences: Arc<SequenceEngine>,
}

impl Station {
    /// Spawn a protocol engine on `transport` and wire everything to it.
    /// Must be called from within a tokio runtime.
    pub fn build(
        config: StationConfig,
        sequences: ValidatedSequences,
        transport: Arc<dyn LinkTransport>,
    ) -> Self {
        let engine = ProtocolEngine::spawn(transport, config.protocol.clone());
        let link: Arc<dyn CommandLink> = Arc::new(engine.clone());
        let heartbeat: Arc<dyn HeartbeatControl> = Arc::new(Heartbeat::new(
            link.clone(),
            Duration::from_millis(config.heartbeat_ms),
        ));
        let mut station = Self::with_link(config, sequences, link, heartbeat);
        station.engine = Some(engine);
        station
    }

    /// Wire the station to an existing link and heartbeat.  No protocol
    /// engine is attached, so [`connect`](Self::connect) is unavailable.
    pub fn with_link(
        config: StationConfig,
        sequences: ValidatedSequences,
        link: Arc<dyn CommandLink>,
        heartbeat: Arc<dyn HeartbeatControl>,
    ) -> Self {
        let failsafe = Arc::new(Failsafe::new(
            link.clone(),
            heartbeat.clone(),
            ValveRoles::from(&config.failsafe_roles),
            &config.failsafe,
        ));
        let engine = SequenceEngine::new(link.clone(), failsafe.clone(), sequences, &config);
        Self {
            config,
            engine: None,
            link,
            heartbeat,
            failsafe,
            sequences: Arc::new(engine),
        }
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn engine(&self) -> Option<&ProtocolEngine> {
        self.engine.as_ref()
    }

    pub fn sequences(&self) -> &Arc<SequenceEngine> {
        &self.sequences
    }

    pub fn failsafe(&self) -> &Arc<Failsafe> {
        &self.failsafe
    }

    pub fn heartbeat(&self) -> &Arc<dyn HeartbeatControl> {
        &self.heartbeat
    }

    /// Open the configured port, complete the handshake and start the
    /// heartbeat daemon.
    pub async fn connect(&self) -> Result<(), StationError> {
        let engine = self.engine.as_ref().ok_or(StationError::NoLink)?;
        engine.connect(self.config.serial.clone()).await?;
        self.heartbeat.start();
        log::info!("[station] connected to {}", self.config.serial.port_name);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), StationError> {
        self.heartbeat.stop();
        let engine = self.engine.as_ref().ok_or(StationError::NoLink)?;
        engine.disconnect().await?;
        Ok(())
    }

    /// Route one inbound line.
    pub async fn handle_line(&self, line: &str) -> LineAction {
        match codec::parse_inbound(line) {
            InboundLine::Emergency(_) => {
                self.enter_emergency(line).await;
                LineAction::Emergency
            }
            InboundLine::EmergencyCleared => {
                log::warn!("[station] emergency cleared");
                self.failsafe.set_emergency_active(false);
                self.heartbeat.start();
                LineAction::EmergencyCleared
            }
            InboundLine::Telemetry(_) => {
                self.sequences.on_serial_data(line);
                LineAction::Telemetry
            }
            InboundLine::Malformed { reason, .. } => {
                log::warn!("[station] malformed line '{}': {}", line, reason);
                LineAction::Ignored
            }
            other => {
                if other.is_state_marker() {
                    log::info!("[station] {}", line);
                }
                LineAction::Ignored
            }
        }
    }

    async fn enter_emergency(&self, line: &str) {
        log::error!("[station] emergency from controller: {}", line);
        self.link.clear_queue().await;
        self.link.abort_inflight(EMERGENCY_REASON).await;
        self.link.abort_all_pendings(EMERGENCY_REASON).await;
        self.heartbeat.stop();
        self.failsafe.set_emergency_active(true);
        self.sequences.cancel();
    }

    /// The operator UI went away.  Cancels the run and/or runs the
    /// failsafe, per configuration.
    pub async fn on_controller_lost(&self) -> Option<FailsafeOutcome> {
        log::warn!("[station] controller lost");
        if self.config.failsafe.cancel_on_controller_lost {
            self.sequences.cancel();
        }
        if self.config.failsafe.on_controller_lost {
            Some(self.failsafe.try_fail_safe("controller lost").await)
        } else {
            None
        }
    }

    pub async fn run_sequence(&self, name: &str) -> Result<(), StationError> {
        self.sequences.start(name).await?;
        Ok(())
    }

    /// Forward engine events to [`handle_line`](Self::handle_line).  State
    /// markers arrive on the engine's lossless marker stream, so a lagging
    /// event stream can drop telemetry but never an `EMERG`.  The task holds
    /// the station and runs until aborted.  `None` when no protocol engine
    /// is attached.
    pub fn spawn_event_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let engine = self.engine.as_ref()?;
        let mut markers = engine.subscribe_markers();
        let mut events = engine.subscribe();
        let station = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    marker = markers.recv() => match marker {
                        Some(line) => {
                            station.handle_line(&line).await;
                        }
                        None => break,
                    },
                    event = events.recv() => match event {
                        Ok(TransportEvent::Data(line)) => {
                            if !codec::parse_inbound(&line).is_state_marker() {
                                station.handle_line(&line).await;
                            }
                        }
                        Ok(TransportEvent::Error(e)) => log::warn!("[station] {}", e),
                        Ok(TransportEvent::Status(status)) => {
                            log::info!("[station] link {:?}", status)
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("[station] event pump lagged, {} events dropped", n)
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            log::debug!("[station] event pump stopped");
        }))
    }
}
