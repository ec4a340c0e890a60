//! Missing-chunk rounds: reporting on the receiving side, retransmission
//! on the sending side.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use quickport_core::recovery::paginate;
use quickport_core::wire::encode_frame;
use quickport_core::Envelope;

use crate::net::send_envelope;

/// Data of chunk `index` within `payload`, by fixed offset.
/// Returns `None` past the end.
pub fn chunk_slice(payload: &[u8], chunk_size: usize, index: u32) -> Option<&[u8]> {
    let start = (index as usize).checked_mul(chunk_size)?;
    if start >= payload.len() {
        return None;
    }
    let end = (start + chunk_size).min(payload.len());
    Some(&payload[start..end])
}

/// Send chunk `index` of `payload` as one frame.
pub async fn send_chunk(
    socket: &UdpSocket,
    to: SocketAddr,
    payload: &[u8],
    chunk_size: usize,
    index: u32,
) -> io::Result<bool> {
    let Some(data) = chunk_slice(payload, chunk_size, index) else {
        return Ok(false);
    };
    let frame = encode_frame(index, data).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    socket.send_to(&frame, to).await?;
    tracing::trace!(index, len = data.len(), "chunk sent");
    Ok(true)
}

/// Resend the listed chunks from the compressed buffer. Indices past the
/// end of the payload are skipped. Returns how many were sent.
pub async fn resend_chunks(
    socket: &UdpSocket,
    to: SocketAddr,
    payload: &[u8],
    chunk_size: usize,
    indices: &[u32],
) -> io::Result<usize> {
    let mut sent = 0;
    for &index in indices {
        if send_chunk(socket, to, payload, chunk_size, index).await? {
            sent += 1;
        } else {
            tracing::debug!(index, "peer asked for a chunk beyond the payload");
        }
    }
    Ok(sent)
}

/// Report `missing` to the sender, split into pages. Returns the page count.
pub async fn send_missing(
    socket: &UdpSocket,
    to: SocketAddr,
    missing: &[u32],
    per_page: usize,
) -> io::Result<usize> {
    let pages = paginate(missing, per_page);
    for page in &pages {
        send_envelope(socket, to, &Envelope::PacketInfo(page.clone())).await?;
    }
    Ok(pages.len())
}
