//! Session types and the handshake that produces them.
//!
//! Each side owns two UDP sockets. The primary carries the handshake,
//! requests, heartbeats and chat; the secondary carries everything that
//! belongs to a running transfer. Only the receive dispatcher ever reads
//! the primary once the session is up; the secondary is read through the
//! session's [`DataPlane`].

pub mod initiator;
pub mod listener;
mod state;

pub use initiator::connect;
pub use listener::{listen, AccessDecider, AccessRequest};
pub use state::HandshakeState;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use quickport_core::config::NetworkConfig;
use quickport_core::EnvelopeKind;

use crate::data::DataPlane;
use crate::dispatch::PauseGate;
use crate::liveness::LivenessState;
use crate::net::bind_udp;

/// Our half of a session.
#[derive(Debug)]
pub struct SelfConfig {
    pub name: String,
    pub primary: Arc<UdpSocket>,
    pub secondary: Arc<UdpSocket>,
    pub primary_addr: SocketAddr,
    pub secondary_addr: SocketAddr,
}

impl SelfConfig {
    pub fn new(name: impl Into<String>, primary: UdpSocket, secondary: UdpSocket) -> io::Result<Self> {
        Ok(Self {
            name: name.into(),
            primary_addr: primary.local_addr()?,
            secondary_addr: secondary.local_addr()?,
            primary: Arc::new(primary),
            secondary: Arc::new(secondary),
        })
    }

    /// Bind both sockets by probing the configured port range.
    pub fn bind(name: impl Into<String>, network: &NetworkConfig) -> Result<Self, HandshakeError> {
        let primary = probe_bind(network.bind_ip, network.base_port, network.max_port)?;
        let secondary = probe_bind(network.bind_ip, network.base_port, network.max_port)?;
        let me = Self::new(name, primary, secondary)?;
        tracing::info!(
            primary = %me.primary_addr,
            secondary = %me.secondary_addr,
            "sockets bound"
        );
        Ok(me)
    }

    /// Bind fresh sockets on the addresses this config was using.
    ///
    /// Every other clone of the current sockets must already be dropped.
    pub async fn rebind(mut self) -> io::Result<Self> {
        let (primary_addr, secondary_addr) = (self.primary_addr, self.secondary_addr);
        let name = std::mem::take(&mut self.name);
        drop(self);
        Self::bind_at(name, primary_addr, secondary_addr).await
    }

    /// Bind both sockets on exact addresses. The kernel may take a moment
    /// to release ports whose owning tasks just exited, so binding is
    /// retried briefly.
    pub async fn bind_at(
        name: impl Into<String>,
        primary_addr: SocketAddr,
        secondary_addr: SocketAddr,
    ) -> io::Result<Self> {
        let primary = bind_with_retry(primary_addr).await?;
        let secondary = bind_with_retry(secondary_addr).await?;
        Self::new(name, primary, secondary)
    }
}

async fn bind_with_retry(addr: SocketAddr) -> io::Result<UdpSocket> {
    const ATTEMPTS: u32 = 20;
    let mut attempt = 0;
    loop {
        match bind_udp(addr) {
            Ok(s) => return Ok(s),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bind the first free port in `base..=max`. A `base` of 0 lets the OS pick.
pub fn probe_bind(ip: IpAddr, base: u16, max: u16) -> Result<UdpSocket, HandshakeError> {
    if base == 0 {
        return Ok(bind_udp(SocketAddr::new(ip, 0))?);
    }
    for port in base..=max.max(base) {
        match bind_udp(SocketAddr::new(ip, port)) {
            Ok(socket) => return Ok(socket),
            Err(e) => tracing::trace!(port, error = %e, "port unavailable"),
        }
    }
    Err(HandshakeError::NoFreePort { base, max })
}

/// The remote half of a session, fixed once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,
    pub primary_addr: SocketAddr,
    pub secondary_addr: SocketAddr,
}

/// A live session. Cheap to clone; all clones share the same sockets,
/// pause gate and liveness state.
#[derive(Debug, Clone)]
pub struct Handle {
    pub local: Arc<SelfConfig>,
    pub peer: Arc<PeerConfig>,
    /// Transfer traffic on the secondary socket, both directions.
    pub data: Arc<DataPlane>,
    pub pause: PauseGate,
    pub liveness: Arc<LivenessState>,
}

impl Handle {
    pub fn new(local: SelfConfig, peer: PeerConfig, ping_timeout: Duration) -> Self {
        let data = DataPlane::new(Arc::clone(&local.secondary), peer.secondary_addr);
        Self {
            local: Arc::new(local),
            peer: Arc::new(peer),
            data: Arc::new(data),
            pause: PauseGate::new(),
            liveness: Arc::new(LivenessState::new(ping_timeout)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("expected an Auth message, got {0}")]
    UnexpectedMessageKind(EnvelopeKind),
    #[error("no response from peer within {0:?}")]
    Timeout(Duration),
    #[error("no free UDP port in {base}..={max}")]
    NoFreePort { base: u16, max: u16 },
    #[error("access decision failed: {0}")]
    Decision(#[source] anyhow::Error),
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),
}
