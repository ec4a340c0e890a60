//! Hosting side of the handshake.
//!
//! The listener waits for an access request from anyone, asks the operator,
//! and answers. A refusal sends the listener back to waiting; only an
//! accepted request ends the loop.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::runtime::RuntimeFlavor;
use tokio::time::Instant;

use quickport_core::message::{AuthFlag, AuthMeta};
use quickport_core::wire::MAX_DATAGRAM;
use quickport_core::{Datagram, Envelope};

use super::state::{HandshakeState, Tracker};
use super::{HandshakeError, PeerConfig, SelfConfig};
use crate::net::{recv_datagram, send_envelope};

/// A pending request shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub name: String,
    pub from: SocketAddr,
}

/// Human-in-the-loop decision. `decide` may block (e.g. on stdin).
pub trait AccessDecider: Send {
    fn decide(&mut self, request: &AccessRequest) -> anyhow::Result<bool>;
}

impl<F> AccessDecider for F
where
    F: FnMut(&AccessRequest) -> anyhow::Result<bool> + Send,
{
    fn decide(&mut self, request: &AccessRequest) -> anyhow::Result<bool> {
        self(request)
    }
}

/// Wait for a peer and admit it. `wait = None` waits indefinitely.
pub async fn listen<D: AccessDecider>(
    local: &SelfConfig,
    decider: &mut D,
    wait: Option<Duration>,
) -> Result<PeerConfig, HandshakeError> {
    let mut tracker = Tracker::new("listener");
    let deadline = wait.map(|w| Instant::now() + w).unwrap_or_else(far_future);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    tracing::info!(addr = %local.primary_addr, "waiting for access requests");

    loop {
        let Some((datagram, from)) = recv_datagram(&local.primary, None, deadline, &mut buf).await?
        else {
            return Err(HandshakeError::Timeout(wait.unwrap_or_default()));
        };

        let meta = match datagram {
            Datagram::Envelope(Envelope::Auth(meta)) if meta.flag == AuthFlag::AccessRequest => meta,
            Datagram::Envelope(other) => {
                tracing::warn!(%from, kind = %other.kind(), "ignoring non-request while listening");
                continue;
            }
            Datagram::Chunk(_) => continue,
        };

        tracker.advance(HandshakeState::AwaitingOperatorDecision);
        let request = AccessRequest {
            name: meta.name.clone(),
            from,
        };
        tracing::info!(peer = %request.name, %from, "access request received");

        let allowed = ask(decider, &request).map_err(HandshakeError::Decision)?;

        let reply = Envelope::Auth(AuthMeta {
            name: local.name.clone(),
            secondary_port: local.secondary_addr.port(),
            flag: if allowed { AuthFlag::Allow } else { AuthFlag::Deny },
        });
        send_envelope(&local.primary, from, &reply).await?;

        if allowed {
            tracker.advance(HandshakeState::Established);
            let peer = PeerConfig {
                name: meta.name,
                primary_addr: from,
                secondary_addr: SocketAddr::new(from.ip(), meta.secondary_port),
            };
            tracing::info!(peer = %peer.name, secondary = %peer.secondary_addr, "peer admitted");
            return Ok(peer);
        }

        tracker.advance(HandshakeState::Idle);
        tracing::info!(peer = %request.name, %from, "peer refused, waiting again");
    }
}

/// Run a possibly blocking decision without starving other tasks.
fn ask<D: AccessDecider>(decider: &mut D, request: &AccessRequest) -> anyhow::Result<bool> {
    match tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| decider.decide(request)),
        _ => decider.decide(request),
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}
