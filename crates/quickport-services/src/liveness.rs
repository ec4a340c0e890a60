//! Liveness monitor.
//!
//! One side sends a `Ping` on the primary socket every few seconds while
//! its pause gate is open. The other side records each ping; a watchdog
//! compares the time since the last one against the ping timeout and
//! raises an alert that escalates the longer the silence lasts. Nothing is
//! torn down automatically: the operator decides whether to reset.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use quickport_core::Envelope;

use crate::event::SessionEvent;
use crate::net::send_envelope;
use crate::session::Handle;

/// Floor for loop periods; `tokio::time::interval` rejects zero.
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    /// Silent for one timeout.
    Warn,
    /// Silent for two timeouts.
    Degraded,
    /// Silent for four timeouts; the peer is probably gone.
    Lost,
}

impl AlertLevel {
    fn for_silence(silent: Duration, timeout: Duration) -> Option<Self> {
        if timeout.is_zero() || silent < timeout {
            None
        } else if silent < timeout * 2 {
            Some(Self::Warn)
        } else if silent < timeout * 4 {
            Some(Self::Degraded)
        } else {
            Some(Self::Lost)
        }
    }
}

#[derive(Debug)]
struct Inner {
    last_ping: Instant,
    raised: Option<AlertLevel>,
}

/// Heartbeat bookkeeping shared by the dispatcher (writer) and the
/// watchdog (reader).
#[derive(Debug)]
pub struct LivenessState {
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl LivenessState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Mutex::new(Inner {
                last_ping: Instant::now(),
                raised: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Restart the deadline. Returns the alert level that was active, if any.
    pub fn record_ping(&self) -> Option<AlertLevel> {
        self.record_ping_at(Instant::now())
    }

    pub fn record_ping_at(&self, now: Instant) -> Option<AlertLevel> {
        let mut inner = self.lock();
        inner.last_ping = now;
        inner.raised.take()
    }

    /// The alert to raise now, if the silence has crossed a level not yet
    /// reported. Each level fires at most once per silence.
    pub fn check_expired(&self, now: Instant) -> Option<(AlertLevel, Duration)> {
        let mut inner = self.lock();
        let silent = now.saturating_duration_since(inner.last_ping);
        let level = AlertLevel::for_silence(silent, self.timeout)?;
        if inner.raised.is_some_and(|r| r >= level) {
            return None;
        }
        inner.raised = Some(level);
        Some((level, silent))
    }

    pub fn silent_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.lock().last_ping)
    }
}

/// Send a ping every `interval` while the pause gate is open.
pub async fn heartbeat_loop(handle: Handle, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval.max(MIN_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("heartbeat stopping");
                return;
            }
            _ = ticker.tick() => {
                if handle.pause.is_paused() {
                    tracing::trace!("paused, heartbeat skipped");
                    continue;
                }
                if let Err(e) = send_envelope(&handle.local.primary, handle.peer.primary_addr, &Envelope::Ping).await {
                    tracing::warn!(error = %e, "heartbeat send failed");
                }
            }
        }
    }
}

/// Check the ping deadline every `tick` and report alerts.
pub async fn watchdog_loop(
    liveness: Arc<LivenessState>,
    tick: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick.max(MIN_TICK));
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("watchdog stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Some((level, silent_for)) = liveness.check_expired(Instant::now()) {
                    tracing::warn!(?level, silent_secs = silent_for.as_secs(), "peer heartbeat missing");
                    let _ = events.send(SessionEvent::LivenessAlert { level, silent_for });
                }
            }
        }
    }
}
