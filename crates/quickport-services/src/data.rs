//! Shared access to the secondary socket.
//!
//! One side may be pulling a file from the peer while serving the peer's
//! own pull, and both transfers talk over the secondary socket. Each holds
//! a [`Lane`] for its [`Role`]. A lane waiting for data either finds it
//! already routed to its queue or takes the read lease, reads one datagram
//! and routes it to whichever role it belongs to. At most one task is ever
//! blocked on the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use quickport_core::message::ControlMessage;
use quickport_core::wire::MAX_DATAGRAM;
use quickport_core::{Datagram, Envelope};

use crate::net::{drain, recv_datagram};

/// Which end of a transfer a lane serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We requested the file and receive its chunks.
    Pull,
    /// The peer requested one of our files.
    Serve,
}

impl Role {
    /// Role a datagram from the peer belongs to.
    ///
    /// The owner of a file only sends an error in place of its index, and
    /// the receiver only after it has the index, so errors go to our pull
    /// while it still awaits one.
    fn of(datagram: &Datagram, pull_awaits_index: bool) -> Option<Self> {
        match datagram {
            Datagram::Chunk(_) | Datagram::Envelope(Envelope::FileIndex(_)) => Some(Self::Pull),
            Datagram::Envelope(
                Envelope::PacketInfo(_)
                | Envelope::Message(ControlMessage::StartTransfer | ControlMessage::Finish(_)),
            ) => Some(Self::Serve),
            Datagram::Envelope(Envelope::Error(_)) if pull_awaits_index => Some(Self::Pull),
            Datagram::Envelope(Envelope::Error(_)) => Some(Self::Serve),
            Datagram::Envelope(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Held by the lane currently playing this role.
    claim: Arc<Mutex<()>>,
    queue: SyncMutex<Option<mpsc::UnboundedSender<Datagram>>>,
}

impl Slot {
    fn set(&self, tx: Option<mpsc::UnboundedSender<Datagram>>) {
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn is_open(&self) -> bool {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Queue `datagram` for the lane holding this slot. `false` if none does.
    fn deliver(&self, datagram: Datagram) -> bool {
        match &*self.queue.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(tx) => tx.send(datagram).is_ok(),
            None => false,
        }
    }
}

/// The secondary socket of a session together with its routing state.
#[derive(Debug)]
pub struct DataPlane {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    read_lease: Mutex<()>,
    pull: Slot,
    serve: Slot,
    pull_awaits_index: AtomicBool,
}

impl DataPlane {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            read_lease: Mutex::new(()),
            pull: Slot::default(),
            serve: Slot::default(),
            pull_awaits_index: AtomicBool::new(false),
        }
    }

    fn slot(&self, role: Role) -> &Slot {
        match role {
            Role::Pull => &self.pull,
            Role::Serve => &self.serve,
        }
    }

    /// Take `role`, waiting up to `wait` for a previous holder to finish.
    pub async fn claim(self: &Arc<Self>, role: Role, wait: Duration) -> Option<Lane> {
        let slot = self.slot(role);
        let claim = tokio::time::timeout(wait, Arc::clone(&slot.claim).lock_owned())
            .await
            .ok()?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        if role == Role::Pull {
            self.pull_awaits_index.store(true, Ordering::Release);
            // Leftovers of an earlier pull would pass for fresh chunks.
            // Only safe while nothing else is reading or being served.
            if !self.serve.is_open() {
                if let Ok(_lease) = self.read_lease.try_lock() {
                    drain(&self.socket, &mut buf);
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        slot.set(Some(tx));
        tracing::trace!(?role, "data lane claimed");
        Some(Lane {
            plane: Arc::clone(self),
            role,
            rx,
            buf,
            _claim: claim,
        })
    }

    /// Hand `datagram` to its role. Returns it when it belongs to `me`.
    fn route(&self, me: Role, datagram: Datagram) -> Option<Datagram> {
        let pull_awaits_index = self.pull_awaits_index.load(Ordering::Acquire);
        match Role::of(&datagram, pull_awaits_index) {
            Some(role) if role == me => Some(datagram),
            Some(role) => {
                if !self.slot(role).deliver(datagram) {
                    tracing::trace!(?role, "no transfer for datagram, dropped");
                }
                None
            }
            None => {
                tracing::trace!("datagram with no transfer role dropped");
                None
            }
        }
    }
}

/// One role's view of the secondary socket. Releasing it frees the role.
#[derive(Debug)]
pub struct Lane {
    plane: Arc<DataPlane>,
    role: Role,
    rx: mpsc::UnboundedReceiver<Datagram>,
    buf: Vec<u8>,
    _claim: OwnedMutexGuard<()>,
}

impl Lane {
    pub fn socket(&self) -> &UdpSocket {
        &self.plane.socket
    }

    pub fn peer(&self) -> SocketAddr {
        self.plane.peer
    }

    /// The pull has its index; errors from here on are the peer receiver's.
    pub fn indexed(&self) {
        if self.role == Role::Pull {
            self.plane.pull_awaits_index.store(false, Ordering::Release);
        }
    }

    /// Next datagram for this role, waiting no later than `deadline`.
    pub async fn recv(&mut self, deadline: Instant) -> io::Result<Option<Datagram>> {
        loop {
            tokio::select! {
                biased;
                routed = self.rx.recv() => return Ok(routed),
                _lease = self.plane.read_lease.lock() => {
                    let plane = &self.plane;
                    let Some((datagram, _)) =
                        recv_datagram(&plane.socket, Some(plane.peer), deadline, &mut self.buf).await?
                    else {
                        return Ok(None);
                    };
                    if let Some(mine) = plane.route(self.role, datagram) {
                        return Ok(Some(mine));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.plane.slot(self.role).set(None);
        if self.role == Role::Pull {
            self.plane.pull_awaits_index.store(false, Ordering::Release);
        }
        tracing::trace!(role = ?self.role, "data lane released");
    }
}
