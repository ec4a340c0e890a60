//! Sending side: serve one file the peer asked for.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use quickport_core::compress::compress;
use quickport_core::config::TransferSettings;
use quickport_core::message::{chunk_count, ControlMessage, FileIndexData, FileRequestData, FinishPacketData};
use quickport_core::recovery::PageAssembler;
use quickport_core::{Datagram, Envelope, ErrorCode};

use super::recovery::{resend_chunks, send_chunk};
use super::{content_hash, resolve_shared, TransferError};
use crate::data::{Lane, Role};
use crate::net::send_envelope;
use crate::session::Handle;

/// Frames sent between cooperative yields while streaming.
const YIELD_EVERY: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub chunks: u32,
    /// Recovery rounds the receiver needed.
    pub rounds: u32,
}

/// Answer a `FileRequest`: index, stream, then retransmit on demand until
/// the receiver finishes or goes quiet.
///
/// Failures before streaming starts are reported to the peer as an error
/// packet on the secondary socket.
pub async fn serve_file(
    handle: &Handle,
    request: FileRequestData,
    settings: &TransferSettings,
) -> Result<Served, TransferError> {
    let socket = &handle.local.secondary;
    let peer = handle.peer.secondary_addr;
    let idle = settings.sender_idle_timeout();

    // One file is served at a time; our own pulls do not hold this up.
    let Some(mut lane) = handle.data.claim(Role::Serve, idle).await else {
        let err = TransferError::FailedFileOperations("already serving another file".into());
        report(socket, peer, &err).await;
        return Err(err);
    };

    let (index, payload) = match prepare(&request, settings).await {
        Ok(prepared) => prepared,
        Err(err) => {
            report(socket, peer, &err).await;
            return Err(err);
        }
    };

    send_envelope(socket, peer, &Envelope::FileIndex(index.clone())).await?;
    tracing::info!(
        path = %index.file_path,
        size = index.total_size,
        chunks = index.chunk_count,
        mode = %request.compression,
        "file index sent"
    );

    // Nothing is streamed until the receiver says it is ready.
    loop {
        let deadline = Instant::now() + idle;
        match next_envelope(&mut lane, deadline).await? {
            None => {
                return Err(TransferError::Timeout {
                    phase: "start signal",
                    waited: idle,
                })
            }
            Some(Envelope::Message(ControlMessage::StartTransfer)) => break,
            Some(Envelope::Message(ControlMessage::Finish(finish))) => return finished(finish, &index, 0),
            Some(Envelope::Error(e)) => return Err(TransferError::Peer { code: e.code, error: e.error }),
            Some(other) => tracing::debug!(kind = %other.kind(), "ignored while awaiting start"),
        }
    }

    let chunk_size = index.chunk_size as usize;
    for i in 0..index.chunk_count {
        send_chunk(socket, peer, &payload, chunk_size, i).await?;
        if i % YIELD_EVERY == YIELD_EVERY - 1 {
            tokio::task::yield_now().await;
        }
    }
    tracing::debug!(chunks = index.chunk_count, "first pass streamed");

    let mut assembler = PageAssembler::new();
    let mut rounds = 0u32;
    loop {
        let deadline = Instant::now() + idle;
        match next_envelope(&mut lane, deadline).await? {
            None => {
                return Err(TransferError::Timeout {
                    phase: "finish",
                    waited: idle,
                })
            }
            Some(Envelope::PacketInfo(page)) => {
                if let Some(missing) = assembler.add(page) {
                    rounds += 1;
                    let resent = resend_chunks(socket, peer, &payload, chunk_size, &missing).await?;
                    tracing::debug!(round = rounds, requested = missing.len(), resent, "chunks retransmitted");
                }
            }
            Some(Envelope::Message(ControlMessage::Finish(finish))) => return finished(finish, &index, rounds),
            Some(Envelope::Error(e)) => return Err(TransferError::Peer { code: e.code, error: e.error }),
            Some(other) => tracing::trace!(kind = %other.kind(), "ignored during recovery"),
        }
    }
}

/// Read, hash and compress the requested file.
async fn prepare(
    request: &FileRequestData,
    settings: &TransferSettings,
) -> Result<(FileIndexData, Bytes), TransferError> {
    let path = resolve_shared(&settings.share_dir, &request.file_path)?;

    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|_| TransferError::FileNotFound(request.file_path.clone()))?;
    if meta.is_dir() {
        return Err(TransferError::FileNotFound(format!("{} is a directory", request.file_path)));
    }

    let raw = tokio::fs::read(&path)
        .await
        .map_err(|e| TransferError::FailedFileOperations(format!("{}: {e}", path.display())))?;

    let mode = request.compression;
    let (file_hash, packed) = tokio::task::spawn_blocking(move || {
        let hash = content_hash(&raw);
        (hash, compress(&raw, mode))
    })
    .await
    .map_err(|e| TransferError::FailedCalcFileHash(e.to_string()))?;
    let payload = packed.map_err(|e| TransferError::FailedCompress(e.to_string()))?;

    let total_size = payload.len() as u64;
    if total_size > settings.max_file_bytes {
        return Err(TransferError::FailedFileOperations(format!(
            "{} compresses to {total_size} bytes, over the {} byte limit",
            request.file_path, settings.max_file_bytes
        )));
    }
    let chunk_size = settings.effective_chunk_size();
    let count = chunk_count(total_size, chunk_size).ok_or_else(|| {
        TransferError::FailedFileOperations(format!("{} has too many chunks", request.file_path))
    })?;
    let index = FileIndexData {
        file_path: request.file_path.clone(),
        total_size,
        chunk_count: count,
        file_hash,
        chunk_size,
    };
    Ok((index, Bytes::from(payload)))
}

fn finished(finish: FinishPacketData, index: &FileIndexData, rounds: u32) -> Result<Served, TransferError> {
    if finish.success {
        Ok(Served {
            chunks: index.chunk_count,
            rounds,
        })
    } else {
        Err(TransferError::Peer {
            code: ErrorCode::FailedReceive,
            error: finish.message,
        })
    }
}

async fn report(socket: &UdpSocket, peer: SocketAddr, err: &TransferError) {
    if let Err(e) = send_envelope(socket, peer, &Envelope::error(err.code(), err.to_string())).await {
        tracing::warn!(error = %e, "could not report transfer failure to peer");
    }
}

/// Next envelope for the serving side of the data plane.
async fn next_envelope(lane: &mut Lane, deadline: Instant) -> std::io::Result<Option<Envelope>> {
    loop {
        match lane.recv(deadline).await? {
            None => return Ok(None),
            Some(Datagram::Envelope(e)) => return Ok(Some(e)),
            Some(Datagram::Chunk(c)) => tracing::trace!(index = c.index, "stray chunk ignored"),
        }
    }
}
