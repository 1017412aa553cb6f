//! Adaptive send pacing and reconnect backoff.

use hotfire_core::ProtocolSettings;
use std::time::Duration;

/// Minimum gap between consecutive transmissions.
///
/// Widened multiplicatively on every BUSY from the controller and decayed
/// multiplicatively on every ACK, always clamped to `[floor, ceiling]`.
#[derive(Debug, Clone)]
pub struct Pacing {
    interval_ms: f64,
    floor_ms: f64,
    ceiling_ms: f64,
    busy_factor: f64,
    decay: f64,
}

impl Pacing {
    pub fn new(settings: &ProtocolSettings) -> Self {
        let floor_ms = settings.pacing_min_ms as f64;
        let ceiling_ms = (settings.pacing_max_ms as f64).max(floor_ms);
        Self {
            interval_ms: (settings.pacing_initial_ms as f64).clamp(floor_ms, ceiling_ms),
            floor_ms,
            ceiling_ms,
            busy_factor: settings.busy_backoff_factor.max(1.0),
            decay: settings.pacing_decay.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.round() as u64)
    }

    pub fn on_busy(&mut self) {
        // A zero floor would never grow under multiplication.
        let base = self.interval_ms.max(1.0);
        self.interval_ms = (base * self.busy_factor).min(self.ceiling_ms);
    }

    pub fn on_ack(&mut self) {
        self.interval_ms = (self.interval_ms * self.decay).max(self.floor_ms);
    }
}

/// Exponential reconnect delay: `initial`, `2·initial`, … capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
            attempts: 0,
        }
    }

    pub fn from_settings(settings: &ProtocolSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_initial_ms),
            Duration::from_millis(settings.reconnect_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(prev) => prev.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        self.attempts += 1;
        delay
    }

    /// Attempts scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempts = 0;
    }
}
