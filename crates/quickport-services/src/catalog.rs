//! The shared-file catalog ("tray") and its exchange right after the
//! handshake.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;

use quickport_core::message::FileMeta;
use quickport_core::wire::MAX_DATAGRAM;
use quickport_core::{Datagram, Envelope};

use crate::net::{recv_datagram, send_envelope};
use crate::session::{PeerConfig, SelfConfig};

/// Which side speaks first during the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends its catalog, then waits for the peer's.
    Host,
    /// Waits for the host's catalog, then sends its own.
    Joiner,
}

/// List every regular file under `root`, recursively, with BLAKE3 hashes.
/// Names are relative to `root` and use `/` separators. Sorted by name.
pub fn list_catalog(root: &Path) -> io::Result<Vec<FileMeta>> {
    let mut out = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(rel_dir) = pending.pop() {
        for entry in std::fs::read_dir(root.join(&rel_dir))? {
            let entry = entry?;
            let rel = rel_dir.join(entry.file_name());
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(rel);
            } else if kind.is_file() {
                let mut hasher = blake3::Hasher::new();
                let mut file = std::fs::File::open(entry.path())?;
                let size = io::copy(&mut file, &mut hasher)?;
                out.push(FileMeta {
                    filename: rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    size,
                    hash: hasher.finalize().to_hex().to_string(),
                });
            }
        }
    }

    out.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(out)
}

/// [`list_catalog`] off the async runtime.
pub async fn load_catalog(root: PathBuf) -> io::Result<Vec<FileMeta>> {
    tokio::task::spawn_blocking(move || list_catalog(&root))
        .await
        .map_err(io::Error::other)?
}

/// Drop entries from the end until the `SyncTray` envelope fits in one
/// datagram.
fn fit_datagram(mut catalog: Vec<FileMeta>) -> Vec<FileMeta> {
    let total = catalog.len();
    while !catalog.is_empty() {
        match Envelope::SyncTray(catalog.clone()).encode() {
            Ok(bytes) if bytes.len() <= MAX_DATAGRAM => break,
            _ => {
                catalog.truncate(catalog.len() * 9 / 10);
            }
        }
    }
    if catalog.len() < total {
        tracing::warn!(sent = catalog.len(), total, "catalog truncated to fit one datagram");
    }
    catalog
}

/// Swap catalogs with the peer over the primary socket. Must run before
/// the dispatcher takes the socket over.
pub async fn exchange_catalogs(
    local: &SelfConfig,
    peer: &PeerConfig,
    role: Role,
    ours: Vec<FileMeta>,
    wait: Duration,
) -> anyhow::Result<Vec<FileMeta>> {
    let ours = Envelope::SyncTray(fit_datagram(ours));

    if role == Role::Host {
        send_envelope(&local.primary, peer.primary_addr, &ours)
            .await
            .context("sending catalog")?;
    }

    let theirs = receive_catalog(local, peer, wait).await?;

    if role == Role::Joiner {
        send_envelope(&local.primary, peer.primary_addr, &ours)
            .await
            .context("sending catalog")?;
    }

    tracing::info!(peer = %peer.name, files = theirs.len(), "catalogs exchanged");
    Ok(theirs)
}

async fn receive_catalog(local: &SelfConfig, peer: &PeerConfig, wait: Duration) -> anyhow::Result<Vec<FileMeta>> {
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match recv_datagram(&local.primary, Some(peer.primary_addr), deadline, &mut buf).await? {
            None => anyhow::bail!("peer catalog not received within {wait:?}"),
            Some((Datagram::Envelope(Envelope::SyncTray(catalog)), _)) => return Ok(catalog),
            Some((Datagram::Envelope(other), _)) => {
                tracing::debug!(kind = %other.kind(), "ignored while awaiting catalog");
            }
            Some((Datagram::Chunk(_), _)) => {}
        }
    }
}
