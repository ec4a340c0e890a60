//! Receiving side: pull one file from the peer.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::time::Instant;

use quickport_core::compress::{decompress, CompressionMode};
use quickport_core::config::TransferSettings;
use quickport_core::message::{chunk_count, ControlMessage, FileIndexData, FileRequestData};
use quickport_core::recovery::missing_indices;
use quickport_core::wire::{ChunkFrame, MAX_CHUNK_DATA};
use quickport_core::{Datagram, Envelope};

use super::recovery::send_missing;
use super::{content_hash, resolve_shared, TransferError};
use crate::data::{Lane, Role};
use crate::net::send_envelope;
use crate::session::Handle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub path: PathBuf,
    /// Uncompressed size written to disk.
    pub bytes: u64,
    pub chunks: u32,
    pub rounds: u32,
}

/// Fetch `file_path` from the peer into the download directory.
///
/// The dispatcher's pause gate is held for the whole exchange. The peer
/// may pull from us meanwhile. Local failures after the peer has indexed
/// the file are reported to it; the partial output is removed on any
/// failure.
pub async fn get_file(
    handle: &Handle,
    file_path: &str,
    mode: CompressionMode,
    settings: &TransferSettings,
) -> Result<Received, TransferError> {
    // Refuse locally what the peer would refuse anyway.
    let relative = resolve_shared(Path::new(""), file_path)?;
    let file_name = relative
        .file_name()
        .ok_or_else(|| TransferError::FileNotFound(file_path.to_string()))?
        .to_owned();

    let _pause = handle.pause.pause();
    let idle = settings.sender_idle_timeout();
    let mut lane = handle
        .data
        .claim(Role::Pull, idle)
        .await
        .ok_or(TransferError::Timeout {
            phase: "previous download",
            waited: idle,
        })?;

    let request = Envelope::FileRequest(FileRequestData {
        file_path: file_path.to_string(),
        compression: mode,
    });
    send_envelope(&handle.local.primary, handle.peer.primary_addr, &request).await?;
    tracing::info!(path = file_path, %mode, "file requested");

    let index = await_index(&mut lane, file_path, idle).await?;
    lane.indexed();
    if let Err(e) = validate(&index, settings.max_file_bytes) {
        return Err(abort(&lane, e).await);
    }
    tracing::info!(
        path = file_path,
        size = index.total_size,
        chunks = index.chunk_count,
        "file index received"
    );

    let chunks = match chunk_slots(index.chunk_count) {
        Ok(chunks) => chunks,
        Err(e) => return Err(abort(&lane, e).await),
    };

    let output = settings.download_dir.join(&file_name);
    if let Err(e) = prepare_output(&settings.download_dir, &output).await {
        return Err(abort(&lane, e).await);
    }

    let mut transfer = Transfer {
        lane,
        index: &index,
        chunks,
        held: 0,
    };

    let result = transfer.run(mode, settings, &output).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&output).await;
    }
    result
}

struct Transfer<'a> {
    lane: Lane,
    index: &'a FileIndexData,
    chunks: Vec<Option<Bytes>>,
    held: u32,
}

impl Transfer<'_> {
    async fn run(
        &mut self,
        mode: CompressionMode,
        settings: &TransferSettings,
        output: &Path,
    ) -> Result<Received, TransferError> {
        send_envelope(self.lane.socket(), self.lane.peer(), &Envelope::Message(ControlMessage::StartTransfer))
            .await?;

        // First pass: keep reading while chunks keep coming.
        let per_read = settings.chunk_timeout();
        while self.held < self.index.chunk_count {
            if !self.receive_until(Instant::now() + per_read).await? {
                break;
            }
        }
        tracing::debug!(held = self.held, expected = self.index.chunk_count, "first pass done");

        let mut rounds = 0u32;
        loop {
            let missing = missing_indices(self.index.chunk_count, |i| self.chunks[i as usize].is_some());
            if missing.is_empty() {
                break;
            }
            if rounds >= settings.max_retries {
                let err = TransferError::LimitExceeded {
                    rounds,
                    missing: missing.len(),
                };
                return Err(abort(&self.lane, err).await);
            }
            rounds += 1;

            let pages = send_missing(self.lane.socket(), self.lane.peer(), &missing, settings.max_indices_per_page)
                .await?;
            tracing::debug!(round = rounds, missing = missing.len(), pages, "missing chunks reported");

            let deadline = Instant::now() + settings.missing_chunk_timeout();
            while self.held < self.index.chunk_count {
                if !self.receive_until(deadline).await? {
                    break;
                }
            }
        }

        self.finish(mode, output, rounds).await
    }

    /// Take one datagram. `Ok(false)` when the deadline passed.
    async fn receive_until(&mut self, deadline: Instant) -> Result<bool, TransferError> {
        let Some(datagram) = self.lane.recv(deadline).await? else {
            return Ok(false);
        };
        match datagram {
            Datagram::Chunk(frame) => self.accept(frame),
            Datagram::Envelope(Envelope::Error(e)) => {
                return Err(TransferError::Peer {
                    code: e.code,
                    error: e.error,
                })
            }
            Datagram::Envelope(other) => {
                tracing::trace!(kind = %other.kind(), "ignored during transfer");
            }
        }
        Ok(true)
    }

    fn accept(&mut self, frame: ChunkFrame) {
        let i = frame.index;
        if i >= self.index.chunk_count {
            tracing::trace!(index = i, "chunk index out of range");
            return;
        }
        // A damaged chunk counts as never received.
        if !frame.is_intact() || frame.data.len() != self.index.chunk_len(i) {
            tracing::warn!(index = i, "chunk failed checksum");
            return;
        }
        let slot = &mut self.chunks[i as usize];
        if slot.is_none() {
            *slot = Some(frame.data);
            self.held += 1;
            tracing::trace!(index = i, held = self.held, "chunk stored");
        }
    }

    async fn finish(
        &mut self,
        mode: CompressionMode,
        output: &Path,
        rounds: u32,
    ) -> Result<Received, TransferError> {
        let mut packed = Vec::new();
        if packed.try_reserve_exact(self.index.total_size as usize).is_err() {
            let err = TransferError::FailedReceive(format!("cannot hold {} bytes", self.index.total_size));
            return Err(abort(&self.lane, err).await);
        }
        for chunk in self.chunks.iter().flatten() {
            packed.extend_from_slice(chunk);
        }

        let expected = self.index.file_hash.clone();
        let (raw, actual) = match tokio::task::spawn_blocking(move || {
            decompress(&packed, mode).map(|raw| {
                let hash = content_hash(&raw);
                (raw, hash)
            })
        })
        .await
        {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let err = TransferError::FailedDeCompress(e.to_string());
                return Err(abort(&self.lane, err).await);
            }
            Err(e) => {
                let err = TransferError::FailedCalcFileHash(e.to_string());
                return Err(abort(&self.lane, err).await);
            }
        };

        if let Err(e) = tokio::fs::write(output, &raw).await {
            let err = TransferError::FailedFileOperations(format!("{}: {e}", output.display()));
            return Err(abort(&self.lane, err).await);
        }

        if actual != expected {
            let _ = tokio::fs::remove_file(output).await;
            let refusal = Envelope::finish(false, "content hash mismatch");
            send_envelope(self.lane.socket(), self.lane.peer(), &refusal).await?;
            tracing::warn!(path = %output.display(), %expected, %actual, "hash mismatch, output removed");
            return Err(TransferError::HashMismatch { expected, actual });
        }

        send_envelope(self.lane.socket(), self.lane.peer(), &Envelope::finish(true, "ok")).await?;
        tracing::info!(path = %output.display(), bytes = raw.len(), rounds, "file received");
        Ok(Received {
            path: output.to_path_buf(),
            bytes: raw.len() as u64,
            chunks: self.index.chunk_count,
            rounds,
        })
    }
}

async fn await_index(
    lane: &mut Lane,
    file_path: &str,
    wait: std::time::Duration,
) -> Result<FileIndexData, TransferError> {
    let deadline = Instant::now() + wait;
    loop {
        let Some(datagram) = lane.recv(deadline).await? else {
            return Err(TransferError::Timeout {
                phase: "file index",
                waited: wait,
            });
        };
        match datagram {
            Datagram::Envelope(Envelope::FileIndex(index)) if index.file_path == file_path => return Ok(index),
            Datagram::Envelope(Envelope::Error(e)) => {
                return Err(TransferError::Peer {
                    code: e.code,
                    error: e.error,
                })
            }
            Datagram::Envelope(other) => tracing::debug!(kind = %other.kind(), "ignored while awaiting index"),
            Datagram::Chunk(c) => tracing::trace!(index = c.index, "stale chunk ignored"),
        }
    }
}

/// Check a peer's index before anything is sized from it.
fn validate(index: &FileIndexData, max_bytes: u64) -> Result<(), TransferError> {
    if index.total_size > max_bytes {
        return Err(TransferError::FailedReceive(format!(
            "file index announces {} bytes, over the {max_bytes} byte limit",
            index.total_size
        )));
    }
    let size_ok = index.chunk_size as usize <= MAX_CHUNK_DATA
        && chunk_count(index.total_size, index.chunk_size) == Some(index.chunk_count);
    if size_ok {
        Ok(())
    } else {
        Err(TransferError::FailedReceive(format!(
            "inconsistent file index: {} bytes in {} chunks of {}",
            index.total_size, index.chunk_count, index.chunk_size
        )))
    }
}

/// One empty slot per chunk, failing instead of aborting when memory is short.
fn chunk_slots(count: u32) -> Result<Vec<Option<Bytes>>, TransferError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(count as usize)
        .map_err(|e| TransferError::FailedReceive(format!("cannot track {count} chunks: {e}")))?;
    slots.resize(count as usize, None);
    Ok(slots)
}

async fn prepare_output(dir: &Path, output: &Path) -> Result<(), TransferError> {
    let io_err = |e: std::io::Error| TransferError::FailedFileOperations(format!("{}: {e}", output.display()));
    tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    tokio::fs::File::create(output).await.map_err(io_err)?;
    Ok(())
}

/// Tell the peer why we are giving up and hand the error back.
async fn abort(lane: &Lane, err: TransferError) -> TransferError {
    tracing::warn!(error = %err, "transfer aborted");
    let report = Envelope::error(err.code(), err.to_string());
    if let Err(e) = send_envelope(lane.socket(), lane.peer(), &report).await {
        tracing::warn!(error = %e, "could not report failure to peer");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(total: u64, count: u32, size: u32) -> FileIndexData {
        FileIndexData {
            file_path: "f".into(),
            total_size: total,
            chunk_count: count,
            file_hash: String::new(),
            chunk_size: size,
        }
    }

    const LIMIT: u64 = 1 << 30;

    #[test]
    fn index_consistency() {
        assert!(validate(&index(3001, 3, 1400), LIMIT).is_ok());
        assert!(validate(&index(0, 0, 1400), LIMIT).is_ok());
        assert!(validate(&index(3001, 2, 1400), LIMIT).is_err());
        assert!(validate(&index(10, 1, 0), LIMIT).is_err());
        assert!(validate(&index(10, 1, 2000), LIMIT).is_err());
    }

    #[test]
    fn hostile_sizes_are_refused() {
        // Wraps to a chunk count of 0 if truncated to u32.
        let wrapping = index(1400 << 53, 0, 1400);
        assert!(matches!(validate(&wrapping, u64::MAX), Err(TransferError::FailedReceive(_))));

        // Consistent, but more than we will hold.
        let huge = index(LIMIT + 1, chunk_count(LIMIT + 1, 1).unwrap(), 1);
        assert!(matches!(validate(&huge, LIMIT), Err(TransferError::FailedReceive(_))));
        assert!(validate(&index(LIMIT, chunk_count(LIMIT, 1400).unwrap(), 1400), LIMIT).is_ok());
    }

    #[test]
    fn chunk_slots_start_empty() {
        let slots = chunk_slots(3).unwrap();
        assert_eq!(slots.len(), 3);
        assert!(slots.iter().all(Option::is_none));
        assert!(chunk_slots(0).unwrap().is_empty());
    }
}
