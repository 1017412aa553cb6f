//! Heartbeat daemon.
//!
//! Sends `HB` through the acknowledged path at a fixed interval so the
//! controller's watchdog stays fed.  Started and stopped by lifecycle
//! events (connect, emergency enter/exit, sequence runs); the engine
//! itself drops an `HB` whenever the link already has work.

use crate::link::codec::HEARTBEAT;
use crate::link::command::CommandLink;
use crate::link::types::SendOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Start/stop control used by the sequence engine, failsafe and the
/// emergency call site.
pub trait HeartbeatControl: Send + Sync {
    /// Begin sending heartbeats.  Idempotent.
    fn start(&self);

    /// Stop sending heartbeats.  Idempotent.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

pub struct Heartbeat {
    link: Arc<dyn CommandLink>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// A zero `interval` yields a daemon whose `start` is a no-op.
    pub fn new(link: Arc<dyn CommandLink>, interval: Duration) -> Self {
        Self {
            link,
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl HeartbeatControl for Heartbeat {
    /// Must be called from within a tokio runtime.
    fn start(&self) {
        if self.interval.is_zero() {
            return;
        }
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return; // Already running
        }

        let link = self.link.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = link.send(HEARTBEAT, SendOptions::default()).await {
                    log::debug!("[heartbeat] {}", e);
                }
            }
        }));
        log::info!("[heartbeat] started ({}ms)", period.as_millis());
    }

    fn stop(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if let Some(handle) = task.take() {
            handle.abort();
            log::info!("[heartbeat] stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
