//! Joining side of the handshake.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use quickport_core::message::{AuthFlag, AuthMeta};
use quickport_core::wire::MAX_DATAGRAM;
use quickport_core::{Datagram, Envelope};

use super::state::{HandshakeState, Tracker};
use super::{HandshakeError, PeerConfig, SelfConfig};
use crate::net::{recv_datagram, send_envelope};

/// Ask the peer at `target` for access.
///
/// `Ok(None)` means the peer's operator refused; that is a valid outcome,
/// not an error. Only replies from `target` itself are considered.
pub async fn connect(
    local: &SelfConfig,
    target: SocketAddr,
    timeout: Duration,
) -> Result<Option<PeerConfig>, HandshakeError> {
    let mut tracker = Tracker::new("initiator");

    let request = Envelope::Auth(AuthMeta {
        name: local.name.clone(),
        secondary_port: local.secondary_addr.port(),
        flag: AuthFlag::AccessRequest,
    });
    send_envelope(&local.primary, target, &request).await?;
    tracker.advance(HandshakeState::AwaitingAuthResponse);
    tracing::info!(%target, "access requested");

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let Some((datagram, _)) = recv_datagram(&local.primary, Some(target), deadline, &mut buf).await?
        else {
            tracker.advance(HandshakeState::Idle);
            return Err(HandshakeError::Timeout(timeout));
        };

        let envelope = match datagram {
            Datagram::Envelope(e) => e,
            Datagram::Chunk(c) => {
                tracing::trace!(index = c.index, "ignoring chunk during handshake");
                continue;
            }
        };

        match envelope {
            Envelope::Auth(meta) => match meta.flag {
                AuthFlag::Allow => {
                    tracker.advance(HandshakeState::Established);
                    let peer = PeerConfig {
                        name: meta.name,
                        primary_addr: target,
                        secondary_addr: SocketAddr::new(target.ip(), meta.secondary_port),
                    };
                    tracing::info!(
                        peer = %peer.name,
                        secondary = %peer.secondary_addr,
                        "access granted"
                    );
                    return Ok(Some(peer));
                }
                AuthFlag::Deny => {
                    tracker.advance(HandshakeState::Idle);
                    tracing::info!(%target, "access denied");
                    return Ok(None);
                }
                AuthFlag::AccessRequest => {
                    tracing::warn!(%target, state = ?tracker.state(), "peer sent an access request instead of a reply");
                }
            },
            other => {
                tracker.advance(HandshakeState::Idle);
                return Err(HandshakeError::UnexpectedMessageKind(other.kind()));
            }
        }
    }
}
