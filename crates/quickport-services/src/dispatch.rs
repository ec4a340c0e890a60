//! Receive dispatcher: the long-lived owner of the primary socket.
//!
//! Every datagram from the peer's primary address is decoded and routed by
//! kind. File requests are always served, each on its own task, so a peer
//! can pull from us while we are pulling from it. Chat, catalog and file
//! announcements are skipped while the pause gate is engaged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;

use quickport_core::config::TransferSettings;
use quickport_core::message::{ControlMessage, FileRequestData};
use quickport_core::wire::MAX_DATAGRAM;
use quickport_core::{Datagram, Envelope};

use crate::chunk::send::serve_file;
use crate::event::SessionEvent;
use crate::net::recv_datagram;
use crate::session::Handle;

/// Read deadline per loop iteration.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ── Pause gate ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Paused,
}

/// Two-state gate suspending non-essential background work.
///
/// Engaged through [`PauseGate::pause`], which returns a guard that reopens
/// the gate when dropped. Overlapping guards keep the gate paused until the
/// last one is gone.
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    holders: Arc<AtomicUsize>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) -> PauseGuard {
        if self.holders.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::debug!("dispatcher paused");
        }
        PauseGuard {
            holders: self.holders.clone(),
        }
    }

    pub fn state(&self) -> GateState {
        if self.holders.load(Ordering::Acquire) > 0 {
            GateState::Paused
        } else {
            GateState::Open
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state() == GateState::Paused
    }
}

#[must_use = "the gate reopens as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PauseGuard {
    holders: Arc<AtomicUsize>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if self.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!("dispatcher resumed");
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    handle: Handle,
    settings: TransferSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
    serving: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(
        handle: Handle,
        settings: TransferSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            handle,
            settings,
            events,
            serving: JoinSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let socket = self.handle.local.primary.clone();
        let peer = self.handle.peer.primary_addr;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tracing::info!(%peer, "dispatcher running");

        loop {
            // Reap finished transfers without blocking.
            while let Some(res) = self.serving.try_join_next() {
                if let Err(e) = res {
                    if e.is_panic() {
                        tracing::error!(error = %e, "file server task panicked");
                    }
                }
            }

            let deadline = Instant::now() + POLL_INTERVAL;
            let received = tokio::select! {
                _ = shutdown.recv() => {
                    self.serving.shutdown().await;
                    tracing::info!("dispatcher stopped");
                    return Ok(());
                }
                r = recv_datagram(&socket, Some(peer), deadline, &mut buf) => r?,
            };

            match received {
                Some((Datagram::Envelope(envelope), _)) => self.dispatch(envelope),
                Some((Datagram::Chunk(c), _)) => {
                    tracing::trace!(index = c.index, "chunk on primary socket ignored");
                }
                None => {}
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let paused = self.handle.pause.is_paused();
        let kind = envelope.kind();

        match envelope {
            Envelope::FileRequest(request) => self.serve(request),
            Envelope::Ping => {
                if let Some(level) = self.handle.liveness.record_ping() {
                    tracing::info!(?level, "peer heartbeat back");
                    self.emit(SessionEvent::LivenessRestored);
                }
            }
            Envelope::Error(error) => {
                tracing::warn!(code = ?error.code, error = %error.error, "peer reported an error");
                self.emit(SessionEvent::PeerError(error));
            }
            _ if paused => {
                tracing::debug!(%kind, "paused, skipping");
            }
            Envelope::Message(ControlMessage::Text(text)) => self.emit(SessionEvent::PeerMessage(text)),
            Envelope::SyncTray(catalog) => self.emit(SessionEvent::PeerCatalog(catalog)),
            Envelope::File(meta) => self.emit(SessionEvent::PeerFile(meta)),
            _ => {
                tracing::warn!(%kind, "unexpected message on primary socket");
            }
        }
    }

    fn serve(&mut self, request: FileRequestData) {
        let handle = self.handle.clone();
        let settings = self.settings.clone();
        let events = self.events.clone();
        let path = request.file_path.clone();

        tracing::info!(path = %path, mode = %request.compression, "file requested by peer");

        self.serving.spawn(async move {
            let result = serve_file(&handle, request, &settings).await;
            match &result {
                Ok(sent) => tracing::info!(path = %path, chunks = sent.chunks, rounds = sent.rounds, "file served"),
                Err(e) => tracing::warn!(path = %path, error = %e, "serving file failed"),
            }
            let _ = events.send(SessionEvent::TransferServed {
                path,
                result: result.map(|s| s.chunks).map_err(|e| e.to_string()),
            });
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no event consumer");
        }
    }
}
