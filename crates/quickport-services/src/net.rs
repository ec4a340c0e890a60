//! Socket helpers shared by the handshake, transfer and dispatch paths.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use quickport_core::{Datagram, Envelope};

/// Kernel receive buffer requested for every peer socket. Best effort.
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Bind a non-blocking UDP socket with an enlarged receive buffer.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        tracing::debug!(error = %e, "could not enlarge receive buffer");
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

pub async fn send_envelope(socket: &UdpSocket, to: SocketAddr, envelope: &Envelope) -> io::Result<()> {
    let bytes = envelope
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    socket.send_to(&bytes, to).await?;
    tracing::trace!(%to, kind = %envelope.kind(), len = bytes.len(), "envelope sent");
    Ok(())
}

/// Receive the next datagram, waiting no later than `deadline`.
///
/// With `from = Some(addr)` anything not sent by exactly `addr` is dropped.
/// Undecodable datagrams are dropped too. `Ok(None)` means the deadline
/// passed.
pub async fn recv_datagram(
    socket: &UdpSocket,
    from: Option<SocketAddr>,
    deadline: Instant,
    buf: &mut [u8],
) -> io::Result<Option<(Datagram, SocketAddr)>> {
    loop {
        let (len, src) = match tokio::time::timeout_at(deadline, socket.recv_from(buf)).await {
            Err(_) => return Ok(None),
            Ok(Ok(r)) => r,
            // ICMP unreachable from an earlier send surfaces here on some platforms.
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset
                || e.kind() == io::ErrorKind::ConnectionRefused =>
            {
                tracing::trace!(error = %e, "ignoring transient socket error");
                continue;
            }
            Ok(Err(e)) => return Err(e),
        };

        if let Some(expected) = from {
            if src != expected {
                tracing::trace!(%src, %expected, "dropping datagram from unknown source");
                continue;
            }
        }

        match Datagram::parse(&buf[..len]) {
            Ok(datagram) => return Ok(Some((datagram, src))),
            Err(e) => {
                tracing::trace!(%src, error = %e, "dropping undecodable datagram");
                continue;
            }
        }
    }
}

/// Discard anything already queued on `socket`.
pub fn drain(socket: &UdpSocket, buf: &mut [u8]) -> usize {
    let mut dropped = 0;
    while socket.try_recv_from(buf).is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "drained stale datagrams");
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn filters_by_exact_source() {
        let rx = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let rx_addr = rx.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send_envelope(&stranger, rx_addr, &Envelope::Ping).await.unwrap();
        send_envelope(&peer, rx_addr, &Envelope::Ping).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let deadline = Instant::now() + Duration::from_secs(2);
        let (dg, src) = recv_datagram(&rx, Some(peer.local_addr().unwrap()), deadline, &mut buf)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src, peer.local_addr().unwrap());
        assert_eq!(dg, Datagram::Envelope(Envelope::Ping));
    }

    #[tokio::test]
    async fn deadline_yields_none() {
        let rx = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = vec![0u8; 64];
        let got = recv_datagram(&rx, None, Instant::now() + Duration::from_millis(50), &mut buf)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn garbage_is_skipped() {
        let rx = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let rx_addr = rx.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tx.send_to(b"short", rx_addr).await.unwrap();
        send_envelope(&tx, rx_addr, &Envelope::Ping).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let got = recv_datagram(&rx, None, Instant::now() + Duration::from_secs(2), &mut buf)
            .await
            .unwrap();
        assert!(matches!(got, Some((Datagram::Envelope(Envelope::Ping), _))));
    }
}
