//! Transport/protocol engine.
//!
//! One task owns the link and all protocol state: the FIFO send queue, the
//! single in-flight message, pacing, the remote-ready gate, the handshake
//! and the reconnect schedule.  Callers talk to it through a cloneable
//! [`ProtocolEngine`] handle (command channel + oneshot replies); a reader
//! task per connection feeds inbound lines back in.  Every inbound line,
//! terminal failure and status change is fanned out on a broadcast channel.
//! State markers (`READY`, `EMERG…`, `EMERG_CLEARED`, `FAILSAFE…`) are also
//! delivered on unbounded per-subscriber channels, which never drop a line.

use crate::link::codec::{self, InboundLine};
use crate::link::command::CommandLink;
use crate::link::error::TransportError;
use crate::link::pacing::{Backoff, Pacing};
use crate::link::transport::{LineSplitter, LinkTransport};
use crate::link::types::*;
use chrono::{DateTime, Utc};
use hotfire_core::{ProtocolSettings, SerialSettings};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type SendResult = Result<(), TransportError>;

type MarkerSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine commands (handle → engine task)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum EngineCommand {
    Connect {
        settings: SerialSettings,
        reply: oneshot::Sender<SendResult>,
    },
    Disconnect(oneshot::Sender<()>),
    Send {
        payload: String,
        opts: SendOptions,
        reply: oneshot::Sender<SendResult>,
    },
    WriteNow {
        payload: String,
        reply: oneshot::Sender<SendResult>,
    },
    ClearQueue(oneshot::Sender<usize>),
    AbortInflight {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    AbortAllPendings {
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

/// Reader task → engine task.  Tagged with the connection generation so a
/// late event from a torn-down reader is ignored.
enum LinkInput {
    Line { generation: u64, line: String },
    Lost { generation: u64, reason: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to a running protocol engine.  Cheap to clone.
///
/// The engine task stops once every handle has been dropped; any message
/// still pending at that point fails with `Aborted`.
#[derive(Clone)]
pub struct ProtocolEngine {
    cmd_tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<TransportEvent>,
    markers: MarkerSubscribers,
}

impl ProtocolEngine {
    /// Start the engine task.  The link stays closed until [`connect`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`connect`]: ProtocolEngine::connect
    pub fn spawn(transport: Arc<dyn LinkTransport>, settings: ProtocolSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(64);
        let (input_tx, input_rx) = mpsc::channel::<LinkInput>(256);
        let (events, _) = broadcast::channel::<TransportEvent>(256);
        let markers = MarkerSubscribers::default();

        let runner = EngineRunner::new(
            transport,
            settings,
            input_tx,
            events.clone(),
            markers.clone(),
        );
        tokio::spawn(async move {
            runner.run(cmd_rx, input_rx).await;
        });

        Self {
            cmd_tx,
            events,
            markers,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| TransportError::EngineStopped)?;
        rx.await.map_err(|_| TransportError::EngineStopped)
    }

    /// Open the port and perform the HELLO handshake.  Resolves once the
    /// controller answers READY (or ACKs the HELLO), or fails after the
    /// handshake timeout.
    pub async fn connect(&self, settings: SerialSettings) -> Result<(), TransportError> {
        self.request(|reply| EngineCommand::Connect { settings, reply })
            .await?
    }

    /// Close the link, fail everything pending and suppress reconnects.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.request(EngineCommand::Disconnect).await
    }

    /// Acknowledged send with the engine's default timeout and retry cap.
    pub async fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.send_with(payload, SendOptions::default()).await
    }

    pub async fn send_with(&self, payload: &str, opts: SendOptions) -> Result<(), TransportError> {
        let payload = payload.to_string();
        self.request(|reply| EngineCommand::Send {
            payload,
            opts,
            reply,
        })
        .await?
    }

    /// Unframed fire-and-forget write that bypasses the queue.
    pub async fn write_now(&self, payload: &str) -> Result<(), TransportError> {
        let payload = payload.to_string();
        self.request(|reply| EngineCommand::WriteNow { payload, reply })
            .await?
    }

    /// Fail every queued message.  Returns how many were dropped.
    pub async fn clear_queue(&self) -> usize {
        self.request(EngineCommand::ClearQueue).await.unwrap_or(0)
    }

    /// Fail the in-flight message.  Returns whether there was one.
    pub async fn abort_inflight(&self, reason: &str) -> bool {
        let reason = reason.to_string();
        self.request(|reply| EngineCommand::AbortInflight { reason, reply })
            .await
            .unwrap_or(false)
    }

    /// Fail the in-flight message and every queued one.
    pub async fn abort_all_pendings(&self, reason: &str) -> usize {
        let reason = reason.to_string();
        self.request(|reply| EngineCommand::AbortAllPendings { reason, reply })
            .await
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Lossless stream of inbound state-marker lines.  Marker lines are
    /// still published on [`subscribe`](Self::subscribe) as well.
    pub fn subscribe_markers(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, TransportError> {
        self.request(EngineCommand::Snapshot).await
    }
}

#[async_trait::async_trait]
impl CommandLink for ProtocolEngine {
    async fn send(&self, payload: &str, opts: SendOptions) -> Result<(), TransportError> {
        self.send_with(payload, opts).await
    }

    async fn write_now(&self, payload: &str) -> Result<(), TransportError> {
        ProtocolEngine::write_now(self, payload).await
    }

    async fn clear_queue(&self) {
        ProtocolEngine::clear_queue(self).await;
    }

    async fn abort_inflight(&self, reason: &str) {
        ProtocolEngine::abort_inflight(self, reason).await;
    }

    async fn abort_all_pendings(&self, reason: &str) {
        ProtocolEngine::abort_all_pendings(self, reason).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine runner (async task)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Outbound {
    id: u64,
    payload: String,
    attempts: u32,
    max_retries: u32,
    ack_timeout: Duration,
    /// Start of the current wait in the queue.
    queued_at: Instant,
    reply: Option<oneshot::Sender<SendResult>>,
}

impl Outbound {
    fn resolve(mut self, result: SendResult) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }
}

struct Handshake {
    id: u64,
    deadline: Instant,
    /// `None` when the handshake belongs to an automatic reconnect.
    reply: Option<oneshot::Sender<SendResult>>,
}

struct EngineRunner {
    transport: Arc<dyn LinkTransport>,
    settings: ProtocolSettings,
    serial: Option<SerialSettings>,
    port: String,
    state: LinkState,
    queue: VecDeque<Outbound>,
    inflight: Option<(Outbound, Instant)>,
    next_id: u64,
    pacing: Pacing,
    backoff: Backoff,
    remote_ready: bool,
    hold_until: Option<Instant>,
    last_sent: Option<Instant>,
    handshake: Option<Handshake>,
    reconnect_at: Option<Instant>,
    generation: u64,
    reader: Option<CancellationToken>,
    input_tx: mpsc::Sender<LinkInput>,
    events: broadcast::Sender<TransportEvent>,
    markers: MarkerSubscribers,
    connected_at: Option<DateTime<Utc>>,
    stats: LinkStats,
}

impl EngineRunner {
    fn new(
        transport: Arc<dyn LinkTransport>,
        settings: ProtocolSettings,
        input_tx: mpsc::Sender<LinkInput>,
        events: broadcast::Sender<TransportEvent>,
        markers: MarkerSubscribers,
    ) -> Self {
        let port = transport.port_name();
        Self {
            pacing: Pacing::new(&settings),
            backoff: Backoff::from_settings(&settings),
            transport,
            settings,
            serial: None,
            port,
            state: LinkState::Disconnected,
            queue: VecDeque::new(),
            inflight: None,
            next_id: 0,
            remote_ready: true,
            hold_until: None,
            last_sent: None,
            handshake: None,
            reconnect_at: None,
            generation: 0,
            reader: None,
            input_tx,
            events,
            markers,
            connected_at: None,
            stats: LinkStats::default(),
        }
    }

    /// Main engine loop.
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut input_rx: mpsc::Receiver<LinkInput>,
    ) {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(input) = input_rx.recv() => self.handle_input(input).await,
                _ = sleep_until(wake) => self.on_timer().await,
            }
            self.pump().await;
        }

        // Cleanup
        self.reconnect_at = None;
        self.teardown_link().await;
        self.fail_all("engine stopped");
        log::debug!("[link:{}] engine stopped", self.port);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Connect { settings, reply } => self.connect(settings, reply).await,
            EngineCommand::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            EngineCommand::Send {
                payload,
                opts,
                reply,
            } => self.enqueue(payload, opts, reply),
            EngineCommand::WriteNow { payload, reply } => {
                let _ = reply.send(self.write_now(&payload).await);
            }
            EngineCommand::ClearQueue(reply) => {
                let dropped: Vec<Outbound> = self.queue.drain(..).collect();
                let count = dropped.len();
                for msg in dropped {
                    self.abort(msg, "queue cleared");
                }
                if count > 0 {
                    log::info!("[link:{}] cleared {} queued messages", self.port, count);
                }
                let _ = reply.send(count);
            }
            EngineCommand::AbortInflight { reason, reply } => {
                let aborted = match self.inflight.take() {
                    Some((msg, _)) => {
                        self.abort(msg, &reason);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(aborted);
            }
            EngineCommand::AbortAllPendings { reason, reply } => {
                let _ = reply.send(self.fail_all(&reason));
            }
            EngineCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn enqueue(&mut self, payload: String, opts: SendOptions, reply: oneshot::Sender<SendResult>) {
        if !matches!(self.state, LinkState::Connected | LinkState::Handshaking) {
            let _ = reply.send(Err(TransportError::NotOpen));
            return;
        }

        // HB is pointless while the controller already has work from us.
        if codec::is_heartbeat(&payload)
            && (self.inflight.is_some()
                || self.queue.iter().any(|m| !codec::is_heartbeat(&m.payload)))
        {
            self.stats.heartbeats_skipped += 1;
            let _ = reply.send(Ok(()));
            return;
        }

        if self.queue.len() >= self.settings.max_queue {
            match self
                .queue
                .iter()
                .position(|m| !codec::is_priority(&m.payload))
            {
                Some(pos) => {
                    if let Some(evicted) = self.queue.remove(pos) {
                        self.stats.evictions += 1;
                        let err = TransportError::QueueOverflow {
                            payload: evicted.payload.clone(),
                        };
                        self.fail(evicted, err);
                    }
                }
                None if codec::is_priority(&payload) => {
                    log::warn!(
                        "[link:{}] queue full of priority traffic, accepting '{}' over cap",
                        self.port,
                        payload
                    );
                }
                None => {
                    self.stats.failures += 1;
                    log::error!("[link:{}] queue full, rejecting '{}'", self.port, payload);
                    let err = TransportError::QueueOverflow { payload };
                    self.emit(TransportEvent::Error(err.clone()));
                    let _ = reply.send(Err(err));
                    return;
                }
            }
        }

        let msg = Outbound {
            id: self.next_id(),
            payload,
            attempts: 0,
            max_retries: opts
                .max_retries
                .unwrap_or(self.settings.max_retries)
                .max(1),
            ack_timeout: opts
                .ack_timeout
                .unwrap_or_else(|| Duration::from_millis(self.settings.ack_timeout_ms)),
            queued_at: Instant::now(),
            reply: Some(reply),
        };
        log::debug!(
            "[link:{}] queued #{} '{}' (queue {})",
            self.port,
            msg.id,
            msg.payload,
            self.queue.len() + 1
        );
        self.queue.push_back(msg);
    }

    async fn write_now(&mut self, payload: &str) -> SendResult {
        if !self.transport.is_open() {
            return Err(TransportError::NotOpen);
        }
        let line = format!("{}\n", payload);
        self.transport
            .write(line.as_bytes())
            .await
            .map_err(|reason| TransportError::Write {
                payload: payload.to_string(),
                reason,
            })?;
        self.stats.priority_writes += 1;
        log::debug!("[link:{}] priority write '{}'", self.port, payload);
        Ok(())
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            port: self.port.clone(),
            state: self.state,
            queue_len: self.queue.len(),
            inflight: self.inflight.as_ref().map(|(m, _)| InflightInfo {
                id: m.id,
                payload: m.payload.clone(),
                attempts: m.attempts,
            }),
            pacing_ms: self.pacing.interval().as_millis() as u64,
            remote_ready: self.remote_ready,
            connected_at: self.connected_at,
            stats: self.stats.clone(),
        }
    }

    // ── Resolution helpers ───────────────────────────────────────────

    fn fail(&mut self, msg: Outbound, err: TransportError) {
        self.stats.failures += 1;
        log::error!("[link:{}] #{} failed: {}", self.port, msg.id, err);
        self.emit(TransportEvent::Error(err.clone()));
        msg.resolve(Err(err));
    }

    fn abort(&mut self, msg: Outbound, reason: &str) {
        log::warn!(
            "[link:{}] #{} '{}' aborted: {}",
            self.port,
            msg.id,
            msg.payload,
            reason
        );
        let err = TransportError::Aborted {
            payload: msg.payload.clone(),
            reason: reason.to_string(),
        };
        msg.resolve(Err(err));
    }

    fn fail_all(&mut self, reason: &str) -> usize {
        let mut count = 0;
        if let Some((msg, _)) = self.inflight.take() {
            self.abort(msg, reason);
            count += 1;
        }
        let queued: Vec<Outbound> = self.queue.drain(..).collect();
        for msg in queued {
            self.abort(msg, reason);
            count += 1;
        }
        count
    }

    /// Requeue at the head, or fail with `cause` once the cap is reached.
    fn retry_or_fail(&mut self, mut msg: Outbound, cause: TransportError) {
        if msg.attempts >= msg.max_retries {
            self.fail(msg, cause);
        } else {
            self.stats.retries += 1;
            log::warn!(
                "[link:{}] #{} '{}' retry {}/{}: {}",
                self.port,
                msg.id,
                msg.payload,
                msg.attempts,
                msg.max_retries,
                cause
            );
            msg.queued_at = Instant::now();
            self.queue.push_front(msg);
        }
    }

    // ── Transmission ─────────────────────────────────────────────────

    /// When the head of the queue may be transmitted; `None` while
    /// transmission is blocked outright.
    fn send_gate(&self) -> Option<Instant> {
        if self.state != LinkState::Connected || self.inflight.is_some() || self.queue.is_empty()
        {
            return None;
        }
        if !self.remote_ready && self.hold_until.is_none() {
            return None;
        }
        let paced = self.last_sent.map(|t| t + self.pacing.interval());
        let at = match (paced, self.hold_until) {
            (Some(p), Some(h)) => p.max(h),
            (Some(p), None) => p,
            (None, Some(h)) => h,
            (None, None) => Instant::now(),
        };
        Some(at)
    }

    fn queue_timeout(&self) -> Option<Duration> {
        (self.settings.queue_timeout_ms > 0)
            .then(|| Duration::from_millis(self.settings.queue_timeout_ms))
    }

    /// Earliest moment a queued message runs out of time.
    fn queue_deadline(&self) -> Option<Instant> {
        let timeout = self.queue_timeout()?;
        self.queue.iter().map(|m| m.queued_at + timeout).min()
    }

    /// Fail every queued message that has waited past the queue timeout.
    fn expire_queued(&mut self, now: Instant) {
        let Some(timeout) = self.queue_timeout() else { return };
        let (expired, kept): (Vec<Outbound>, Vec<Outbound>) = self
            .queue
            .drain(..)
            .partition(|m| m.queued_at + timeout <= now);
        self.queue.extend(kept);
        for msg in expired {
            let err = TransportError::QueueTimeout {
                payload: msg.payload.clone(),
                waited_ms: now.duration_since(msg.queued_at).as_millis() as u64,
            };
            self.fail(msg, err);
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        [
            self.inflight.as_ref().map(|(_, deadline)| *deadline),
            self.queue_deadline(),
            self.handshake.as_ref().map(|h| h.deadline),
            self.reconnect_at,
            self.send_gate(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn pump(&mut self) {
        loop {
            let Some(at) = self.send_gate() else { return };
            if at > Instant::now() {
                return;
            }
            // An expired busy hold reopens the gate even without READY.
            self.remote_ready = true;
            self.hold_until = None;

            let Some(mut msg) = self.queue.pop_front() else { return };
            msg.attempts += 1;
            let line = format!("{}\n", codec::frame(&msg.payload, msg.id));
            match self.transport.write(line.as_bytes()).await {
                Ok(_) => {
                    let now = Instant::now();
                    self.last_sent = Some(now);
                    self.stats.frames_sent += 1;
                    log::debug!(
                        "[link:{}] -> {} (attempt {})",
                        self.port,
                        line.trim_end(),
                        msg.attempts
                    );
                    let deadline = now + msg.ack_timeout;
                    self.inflight = Some((msg, deadline));
                    return;
                }
                Err(reason) => {
                    let err = TransportError::Write {
                        payload: msg.payload.clone(),
                        reason,
                    };
                    self.fail(msg, err);
                }
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────

    async fn handle_input(&mut self, input: LinkInput) {
        match input {
            LinkInput::Line { generation, line } if generation == self.generation => {
                self.handle_line(line)
            }
            LinkInput::Lost { generation, reason } if generation == self.generation => {
                self.on_link_lost(reason).await
            }
            _ => {}
        }
    }

    fn handle_line(&mut self, line: String) {
        self.stats.lines_rx += 1;
        log::trace!("[link:{}] <- {}", self.port, line);
        let parsed = codec::parse_inbound(&line);
        if parsed.is_state_marker() {
            self.forward_marker(&line);
        }
        self.emit(TransportEvent::Data(line));

        match parsed {
            InboundLine::Ack { id } => self.on_ack(id),
            InboundLine::Nack { id, reason } => self.on_nack(id, reason),
            InboundLine::Ready => {
                self.remote_ready = true;
                self.hold_until = None;
                self.complete_handshake();
            }
            InboundLine::Idle => {
                self.remote_ready = true;
                self.hold_until = None;
            }
            InboundLine::Busy => self.on_busy_signal(),
            InboundLine::Malformed { line, reason } => {
                log::warn!("[link:{}] ignoring '{}': {}", self.port, line, reason);
            }
            _ => {}
        }
    }

    fn forward_marker(&self, line: &str) {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(line.to_string()).is_ok());
    }

    fn on_ack(&mut self, id: u64) {
        if self.handshake.as_ref().is_some_and(|h| h.id == id) {
            self.complete_handshake();
            return;
        }
        match self.inflight.take() {
            Some((msg, _)) if msg.id == id => {
                self.stats.acks += 1;
                self.pacing.on_ack();
                log::debug!("[link:{}] #{} '{}' acknowledged", self.port, id, msg.payload);
                msg.resolve(Ok(()));
            }
            other => {
                self.inflight = other;
                log::debug!("[link:{}] ACK for unknown id {}", self.port, id);
            }
        }
    }

    fn on_nack(&mut self, id: u64, reason: String) {
        match self.inflight.take() {
            Some((msg, _)) if msg.id == id => {
                self.stats.nacks += 1;
                if reason == "BUSY" {
                    self.stats.busy_signals += 1;
                    self.pacing.on_busy();
                    self.hold_until = Some(
                        Instant::now() + Duration::from_millis(self.settings.busy_requeue_delay_ms),
                    );
                }
                let cause = TransportError::Nack {
                    payload: msg.payload.clone(),
                    reason,
                    attempts: msg.attempts,
                };
                self.retry_or_fail(msg, cause);
            }
            other => {
                self.inflight = other;
                log::debug!("[link:{}] NACK for unknown id {} ({})", self.port, id, reason);
            }
        }
    }

    /// `BUSY` without a message id.
    fn on_busy_signal(&mut self) {
        self.stats.busy_signals += 1;
        self.pacing.on_busy();
        self.remote_ready = false;
        self.hold_until =
            Some(Instant::now() + Duration::from_millis(self.settings.busy_requeue_delay_ms));
        if let Some((msg, _)) = self.inflight.take() {
            let cause = TransportError::Nack {
                payload: msg.payload.clone(),
                reason: "BUSY".to_string(),
                attempts: msg.attempts,
            };
            self.retry_or_fail(msg, cause);
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if self.inflight.as_ref().is_some_and(|(_, d)| *d <= now) {
            if let Some((msg, _)) = self.inflight.take() {
                self.stats.timeouts += 1;
                let cause = TransportError::AckTimeout {
                    payload: msg.payload.clone(),
                    attempts: msg.attempts,
                };
                self.retry_or_fail(msg, cause);
            }
        }

        self.expire_queued(now);

        if self.handshake.as_ref().is_some_and(|h| h.deadline <= now) {
            self.handshake_failed().await;
        }

        if self.reconnect_at.is_some_and(|t| t <= now) {
            self.reconnect_at = None;
            self.attempt_reconnect().await;
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    async fn connect(&mut self, settings: SerialSettings, reply: oneshot::Sender<SendResult>) {
        if self.state == LinkState::Connected && self.port == settings.port_name {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.state != LinkState::Disconnected {
            self.teardown_link().await;
            if let Some(hs) = self.handshake.take() {
                if let Some(tx) = hs.reply {
                    let _ = tx.send(Err(TransportError::Aborted {
                        payload: codec::HELLO.to_string(),
                        reason: "superseded by a new connect".to_string(),
                    }));
                }
            }
        }

        self.port = settings.port_name.clone();
        self.serial = Some(settings);
        self.reconnect_at = None;
        self.backoff.reset();

        if let Err(err) = self.open_link().await {
            log::error!("[link:{}] {}", self.port, err);
            self.state = LinkState::Disconnected;
            let _ = reply.send(Err(err));
            return;
        }
        self.start_handshake(Some(reply)).await;
    }

    async fn open_link(&mut self) -> Result<(), TransportError> {
        let settings = self.serial.clone().ok_or(TransportError::NotOpen)?;
        self.transport
            .open(&settings)
            .await
            .map_err(|reason| TransportError::Open {
                port: settings.port_name.clone(),
                reason,
            })?;

        self.generation += 1;
        let token = CancellationToken::new();
        tokio::spawn(read_loop(
            self.transport.clone(),
            self.generation,
            self.input_tx.clone(),
            token.clone(),
            self.port.clone(),
        ));
        self.reader = Some(token);
        self.remote_ready = true;
        self.hold_until = None;
        Ok(())
    }

    async fn start_handshake(&mut self, reply: Option<oneshot::Sender<SendResult>>) {
        let id = self.next_id();
        let line = format!("{}\n", codec::frame(codec::HELLO, id));
        if let Err(reason) = self.transport.write(line.as_bytes()).await {
            let err = TransportError::Write {
                payload: codec::HELLO.to_string(),
                reason,
            };
            log::error!("[link:{}] {}", self.port, err);
            self.teardown_link().await;
            match reply {
                Some(tx) => {
                    self.state = LinkState::Disconnected;
                    let _ = tx.send(Err(err));
                }
                None => self.schedule_reconnect(),
            }
            return;
        }

        let now = Instant::now();
        self.last_sent = Some(now);
        self.state = LinkState::Handshaking;
        self.handshake = Some(Handshake {
            id,
            deadline: now + Duration::from_millis(self.settings.handshake_timeout_ms),
            reply,
        });
        log::info!("[link:{}] HELLO #{} sent, awaiting READY", self.port, id);
    }

    fn complete_handshake(&mut self) {
        let Some(hs) = self.handshake.take() else {
            return;
        };
        self.state = LinkState::Connected;
        self.connected_at = Some(Utc::now());
        self.backoff.reset();
        log::info!("[link:{}] connected", self.port);
        self.emit(TransportEvent::Status(LinkStatus::Connected {
            port: self.port.clone(),
        }));
        if let Some(tx) = hs.reply {
            let _ = tx.send(Ok(()));
        }
    }

    async fn handshake_failed(&mut self) {
        let Some(hs) = self.handshake.take() else {
            return;
        };
        let err = TransportError::HandshakeTimeout {
            timeout_ms: self.settings.handshake_timeout_ms,
        };
        log::warn!("[link:{}] {}", self.port, err);
        self.teardown_link().await;
        match hs.reply {
            Some(tx) => {
                self.state = LinkState::Disconnected;
                let _ = tx.send(Err(err));
            }
            None => self.schedule_reconnect(),
        }
    }

    /// Stop the reader and close the port.  The in-flight message goes
    /// back to the head of the queue without consuming an attempt.
    async fn teardown_link(&mut self) {
        if let Some(token) = self.reader.take() {
            token.cancel();
        }
        self.generation += 1;
        if let Err(e) = self.transport.close().await {
            log::debug!("[link:{}] close: {}", self.port, e);
        }
        if let Some((mut msg, _)) = self.inflight.take() {
            msg.attempts = msg.attempts.saturating_sub(1);
            msg.queued_at = Instant::now();
            self.queue.push_front(msg);
        }
        self.connected_at = None;
    }

    async fn on_link_lost(&mut self, reason: String) {
        if self.state == LinkState::Disconnected {
            return;
        }
        log::warn!("[link:{}] link lost: {}", self.port, reason);
        self.teardown_link().await;
        self.emit(TransportEvent::Status(LinkStatus::Disconnected {
            port: self.port.clone(),
            reason: reason.clone(),
        }));

        if let Some(Handshake { reply: Some(tx), .. }) = self.handshake.take() {
            self.state = LinkState::Disconnected;
            let _ = tx.send(Err(TransportError::Open {
                port: self.port.clone(),
                reason,
            }));
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        self.state = LinkState::Reconnecting;
        self.reconnect_at = Some(Instant::now() + delay);
        log::info!(
            "[link:{}] reconnect attempt {} in {}ms",
            self.port,
            self.backoff.attempts(),
            delay.as_millis()
        );
        self.emit(TransportEvent::Status(LinkStatus::Reconnecting {
            port: self.port.clone(),
            attempt: self.backoff.attempts(),
            delay_ms: delay.as_millis() as u64,
        }));
    }

    async fn attempt_reconnect(&mut self) {
        self.stats.reconnects += 1;
        match self.open_link().await {
            Ok(()) => self.start_handshake(None).await,
            Err(err) => {
                log::warn!("[link:{}] {}", self.port, err);
                self.schedule_reconnect();
            }
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        let was = self.state;
        self.teardown_link().await;
        if let Some(Handshake { reply: Some(tx), .. }) = self.handshake.take() {
            let _ = tx.send(Err(TransportError::Aborted {
                payload: codec::HELLO.to_string(),
                reason: "disconnected".to_string(),
            }));
        }
        self.fail_all("disconnected");
        self.state = LinkState::Disconnected;
        if was != LinkState::Disconnected {
            log::info!("[link:{}] disconnected", self.port);
            self.emit(TransportEvent::Status(LinkStatus::Disconnected {
                port: self.port.clone(),
                reason: "disconnect requested".to_string(),
            }));
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Per-connection reader: bytes → lines → engine task.
async fn read_loop(
    transport: Arc<dyn LinkTransport>,
    generation: u64,
    input_tx: mpsc::Sender<LinkInput>,
    cancel: CancellationToken,
    port: String,
) {
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; 1024];
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = transport.read(&mut buf) => r,
        };
        match result {
            Ok(0) => {}
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if input_tx
                        .send(LinkInput::Line { generation, line })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(reason) => {
                if !cancel.is_cancelled() {
                    let _ = input_tx.send(LinkInput::Lost { generation, reason }).await;
                }
                break;
            }
        }
    }
    log::trace!("[link:{}] reader {} exited", port, generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::transport::SimulatedTransport;

    fn serial() -> SerialSettings {
        SerialSettings {
            port_name: "SIM0".to_string(),
            ..Default::default()
        }
    }

    async fn connected(settings: ProtocolSettings) -> (ProtocolEngine, Arc<SimulatedTransport>) {
        let t = SimulatedTransport::new("SIM0");
        t.inject_line("READY").await;
        let engine = ProtocolEngine::spawn(t.clone(), settings);
        engine.connect(serial()).await.unwrap();
        let hello = t.drain_tx_lines().await;
        assert_eq!(hello, vec![codec::frame("HELLO", 1)]);
        (engine, t)
    }

    fn spawn_send(
        engine: &ProtocolEngine,
        payload: &str,
        opts: SendOptions,
    ) -> tokio::task::JoinHandle<Result<(), TransportError>> {
        let engine = engine.clone();
        let payload = payload.to_string();
        tokio::spawn(async move { engine.send_with(&payload, opts).await })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_connect_is_rejected() {
        let engine = ProtocolEngine::spawn(SimulatedTransport::new("SIM0"), Default::default());
        assert_eq!(engine.send("V,1,O").await, Err(TransportError::NotOpen));
        assert_eq!(engine.write_now("EMERG").await, Err(TransportError::NotOpen));
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.state, LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_resolves_on_ack() {
        let (engine, t) = connected(Default::default()).await;
        let h = spawn_send(&engine, "V,0,O", SendOptions::default());
        settle().await;

        assert_eq!(t.drain_tx_lines().await, vec![codec::frame("V,0,O", 2)]);
        t.inject_line("ACK,2").await;
        assert_eq!(h.await.unwrap(), Ok(()));

        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.stats.acks, 1);
        assert!(snap.inflight.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_drains_one_ack_at_a_time() {
        let (engine, t) = connected(Default::default()).await;
        let handles: Vec<_> = ["V,1,O", "V,2,O", "V,3,O"]
            .iter()
            .map(|p| spawn_send(&engine, p, SendOptions::default()))
            .collect();
        settle().await;

        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.inflight.as_ref().map(|i| i.id), Some(2));
        assert_eq!(snap.queue_len, 2);

        for (expect_id, expect_queue) in [(3u64, 1usize), (4, 0)] {
            t.inject_line(&format!("ACK,{}", expect_id - 1)).await;
            settle().await;
            let snap = engine.snapshot().await.unwrap();
            assert_eq!(snap.inflight.as_ref().map(|i| i.id), Some(expect_id));
            assert_eq!(snap.queue_len, expect_queue);
        }

        t.inject_line("ACK,4").await;
        settle().await;
        let snap = engine.snapshot().await.unwrap();
        assert!(snap.inflight.is_none());
        assert_eq!(snap.queue_len, 0);
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(()));
        }
        assert_eq!(t.drain_tx_lines().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_skipped_while_busy() {
        let (engine, t) = connected(Default::default()).await;
        let _inflight = spawn_send(&engine, "V,1,O", SendOptions::default());
        let _queued = spawn_send(&engine, "V,2,C", SendOptions::default());
        settle().await;

        assert_eq!(engine.send("HB").await, Ok(()));
        let lines = t.drain_tx_lines().await;
        assert!(lines.iter().all(|l| !l.starts_with("HB")));
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.stats.heartbeats_skipped, 1);
        assert_eq!(snap.queue_len, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_when_idle() {
        let (engine, t) = connected(Default::default()).await;
        let h = spawn_send(&engine, "HB", SendOptions::default());
        settle().await;
        assert_eq!(t.drain_tx_lines().await, vec![codec::frame("HB", 2)]);
        t.inject_line("ACK,2").await;
        assert_eq!(h.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_retries_then_fails() {
        let (engine, t) = connected(Default::default()).await;
        let opts = SendOptions {
            ack_timeout: Some(Duration::from_millis(100)),
            max_retries: Some(3),
        };
        let result = spawn_send(&engine, "V,1,O", opts).await.unwrap();
        assert_eq!(
            result,
            Err(TransportError::AckTimeout {
                payload: "V,1,O".into(),
                attempts: 3
            })
        );
        let frame = codec::frame("V,1,O", 2);
        assert_eq!(t.drain_tx_lines().await, vec![frame.clone(), frame.clone(), frame]);
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.stats.timeouts, 3);
        assert_eq!(snap.stats.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_nack_exhausts_retries() {
        let (engine, t) = connected(Default::default()).await;
        let opts = SendOptions {
            ack_timeout: None,
            max_retries: Some(2),
        };
        let h = spawn_send(&engine, "V,1,O", opts);
        settle().await;
        t.inject_line("NACK,2,CRC_ERR").await;
        settle().await;
        t.inject_line("NACK,2,CRC_ERR").await;
        let result = h.await.unwrap();
        assert_eq!(
            result,
            Err(TransportError::Nack {
                payload: "V,1,O".into(),
                reason: "CRC_ERR".into(),
                attempts: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_nack_widens_pacing_and_ack_decays_it() {
        let (engine, t) = connected(Default::default()).await;
        let h = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        t.inject_line("NACK,2,BUSY").await;
        settle().await;

        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.pacing_ms, 40);
        assert_eq!(snap.inflight.as_ref().map(|i| i.attempts), Some(2));

        t.inject_line("ACK,2").await;
        assert_eq!(h.await.unwrap(), Ok(()));
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.pacing_ms, 36);
        assert_eq!(snap.stats.busy_signals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bare_busy_requeues_inflight_and_ready_reopens() {
        let (engine, t) = connected(Default::default()).await;
        let h = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        t.drain_tx().await;

        t.inject_line("BUSY").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snap = engine.snapshot().await.unwrap();
        assert!(!snap.remote_ready);
        assert!(snap.inflight.is_none());
        assert_eq!(snap.queue_len, 1);

        t.inject_line("READY").await;
        settle().await;
        assert_eq!(t.drain_tx_lines().await, vec![codec::frame("V,1,O", 2)]);
        t.inject_line("ACK,2").await;
        assert_eq!(h.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest_non_priority() {
        let settings = ProtocolSettings {
            max_queue: 2,
            ..Default::default()
        };
        let (engine, _t) = connected(settings).await;
        let _inflight = spawn_send(&engine, "V,0,O", SendOptions::default());
        settle().await;
        let oldest = spawn_send(&engine, "V,1,O", SendOptions::default());
        let _second = spawn_send(&engine, "SAFE_CLEAR", SendOptions::default());
        settle().await;
        let _newest = spawn_send(&engine, "V,2,O", SendOptions::default());

        assert_eq!(
            oldest.await.unwrap(),
            Err(TransportError::QueueOverflow {
                payload: "V,1,O".into()
            })
        );
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.queue_len, 2);
        assert_eq!(snap.stats.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_with_only_priority_queued() {
        let settings = ProtocolSettings {
            max_queue: 2,
            ..Default::default()
        };
        let (engine, _t) = connected(settings).await;
        let _inflight = spawn_send(&engine, "V,0,O", SendOptions::default());
        settle().await;
        let _a = spawn_send(&engine, "SAFE_CLEAR", SendOptions::default());
        let _b = spawn_send(&engine, "FAILSAFE", SendOptions::default());
        settle().await;

        assert_eq!(
            engine.send("V,9,O").await,
            Err(TransportError::QueueOverflow {
                payload: "V,9,O".into()
            })
        );
        let _emerg = spawn_send(&engine, "EMERG", SendOptions::default());
        settle().await;
        assert_eq!(engine.snapshot().await.unwrap().queue_len, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_acks_leave_state_untouched() {
        let (engine, t) = connected(Default::default()).await;
        let h = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        for _ in 0..50 {
            t.inject_line("ACK,abc").await;
            t.inject_line("NACK,2").await;
            t.inject_line("ACK,999").await;
        }
        settle().await;

        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.inflight.as_ref().map(|i| i.id), Some(2));
        assert_eq!(snap.queue_len, 0);
        assert_eq!(snap.stats.nacks, 0);

        t.inject_line("ACK,2").await;
        assert_eq!(h.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_pendings_fails_everything() {
        let (engine, _t) = connected(Default::default()).await;
        let handles: Vec<_> = ["V,1,O", "V,2,O", "V,3,O"]
            .iter()
            .map(|p| spawn_send(&engine, p, SendOptions::default()))
            .collect();
        settle().await;

        assert_eq!(engine.abort_all_pendings("emergency").await, 3);
        for h in handles {
            assert!(matches!(
                h.await.unwrap(),
                Err(TransportError::Aborted { reason, .. }) if reason == "emergency"
            ));
        }
        let snap = engine.snapshot().await.unwrap();
        assert!(snap.inflight.is_none());
        assert_eq!(snap.queue_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_keeps_inflight_and_abort_inflight() {
        let (engine, _t) = connected(Default::default()).await;
        let first = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        let _second = spawn_send(&engine, "V,2,O", SendOptions::default());
        let _third = spawn_send(&engine, "V,3,O", SendOptions::default());
        settle().await;

        assert_eq!(engine.clear_queue().await, 2);
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.inflight.as_ref().map(|i| i.payload.as_str()), Some("V,1,O"));

        assert!(engine.abort_inflight("emergency").await);
        assert!(!engine.abort_inflight("emergency").await);
        assert!(matches!(
            first.await.unwrap(),
            Err(TransportError::Aborted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_now_bypasses_queue() {
        let (engine, t) = connected(Default::default()).await;
        let _inflight = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        t.drain_tx().await;

        engine.write_now("V,1,C").await.unwrap();
        assert_eq!(t.drain_tx_lines().await, vec!["V,1,C"]);
        assert_eq!(engine.snapshot().await.unwrap().stats.priority_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_lines_are_published() {
        let (engine, t) = connected(Default::default()).await;
        let mut events = engine.subscribe();
        t.inject_line("pt1:512.25").await;
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Data(line) => {
                    assert_eq!(line, "pt1:512.25");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_markers_survive_event_lag() {
        let (engine, t) = connected(Default::default()).await;
        let mut events = engine.subscribe();
        let mut markers = engine.subscribe_markers();

        for i in 0..300 {
            t.inject_line(&format!("pt1:{}", i)).await;
        }
        t.inject_line("EMERG,pt1:0").await;
        t.inject_line("EMERG_CLEARED").await;

        assert_eq!(markers.recv().await.as_deref(), Some("EMERG,pt1:0"));
        assert_eq!(markers.recv().await.as_deref(), Some("EMERG_CLEARED"));
        assert!(markers.try_recv().is_err());
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_message_times_out_while_reconnecting() {
        let settings = ProtocolSettings {
            queue_timeout_ms: 2_000,
            ..Default::default()
        };
        let (engine, t) = connected(settings).await;
        let h = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        t.drain_tx().await;

        t.set_fail_open(true);
        t.unplug();
        settle().await;
        assert_eq!(engine.snapshot().await.unwrap().queue_len, 1);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        match h.await.unwrap() {
            Err(TransportError::QueueTimeout { payload, waited_ms }) => {
                assert_eq!(payload, "V,1,O");
                assert!(waited_ms >= 2_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.queue_len, 0);
        assert_eq!(snap.state, LinkState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_via_hello_ack() {
        let t = SimulatedTransport::new("SIM0");
        let engine = ProtocolEngine::spawn(t.clone(), Default::default());
        let e = engine.clone();
        let connect = tokio::spawn(async move { e.connect(serial()).await });
        settle().await;
        assert_eq!(t.drain_tx_lines().await, vec![codec::frame("HELLO", 1)]);
        t.inject_line("ACK,1").await;
        assert_eq!(connect.await.unwrap(), Ok(()));
        assert_eq!(engine.snapshot().await.unwrap().state, LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let t = SimulatedTransport::new("SIM0");
        let engine = ProtocolEngine::spawn(t.clone(), Default::default());
        assert_eq!(
            engine.connect(serial()).await,
            Err(TransportError::HandshakeTimeout { timeout_ms: 3000 })
        );
        assert!(!t.is_open());
        assert_eq!(engine.snapshot().await.unwrap().state, LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_reported() {
        let t = SimulatedTransport::new("SIM0");
        t.set_fail_open(true);
        let engine = ProtocolEngine::spawn(t, Default::default());
        assert!(matches!(
            engine.connect(serial()).await,
            Err(TransportError::Open { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplug_requeues_inflight_and_reconnects() {
        let (engine, t) = connected(Default::default()).await;
        let mut events = engine.subscribe();
        let h = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;
        t.drain_tx().await;

        t.unplug();
        settle().await;
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.state, LinkState::Reconnecting);
        assert_eq!(snap.queue_len, 1);
        assert!(snap.inflight.is_none());

        t.inject_line("READY").await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(t.open_count(), 2);
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.state, LinkState::Connected);
        assert_eq!(snap.stats.reconnects, 1);

        let lines = t.drain_tx_lines().await;
        assert_eq!(lines, vec![codec::frame("HELLO", 3), codec::frame("V,1,O", 2)]);
        t.inject_line("ACK,2").await;
        assert_eq!(h.await.unwrap(), Ok(()));

        let mut saw = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let TransportEvent::Status(s) = ev {
                saw.push(s);
            }
        }
        assert!(matches!(saw[0], LinkStatus::Disconnected { .. }));
        assert!(matches!(saw[1], LinkStatus::Reconnecting { attempt: 1, delay_ms: 500, .. }));
        assert!(matches!(saw[2], LinkStatus::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_suppresses_reconnect() {
        let (engine, t) = connected(Default::default()).await;
        let h = spawn_send(&engine, "V,1,O", SendOptions::default());
        settle().await;

        engine.disconnect().await.unwrap();
        assert!(matches!(h.await.unwrap(), Err(TransportError::Aborted { .. })));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(t.open_count(), 1);
        assert_eq!(engine.snapshot().await.unwrap().state, LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_link_trait_delegates() {
        let (engine, t) = connected(Default::default()).await;
        let link: Arc<dyn CommandLink> = Arc::new(engine.clone());
        link.write_now("FAILSAFE").await.unwrap();
        assert_eq!(t.drain_tx_lines().await, vec!["FAILSAFE"]);
        link.abort_all_pendings("sequence exit").await;
        link.clear_queue().await;
    }
}
