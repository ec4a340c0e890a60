//! Reliable chunk transfer: the data plane.
//!
//! A file is read once, hashed, compressed as a whole and held in memory.
//! The compressed payload is cut into fixed-size chunks which are streamed
//! once without acknowledgement; the receiver then reports what it is
//! missing, in pages, until it has everything or runs out of rounds.
//! All of this runs over the secondary sockets.

pub mod receive;
pub mod recovery;
pub mod send;

pub use receive::{get_file, Received};
pub use send::{serve_file, Served};

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use quickport_core::message::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("compression failed: {0}")]
    FailedCompress(String),
    #[error("decompression failed: {0}")]
    FailedDeCompress(String),
    #[error("file operation failed: {0}")]
    FailedFileOperations(String),
    #[error("could not hash file: {0}")]
    FailedCalcFileHash(String),
    #[error("receive failed: {0}")]
    FailedReceive(String),
    #[error("gave up after {rounds} recovery rounds with {missing} chunks still missing")]
    LimitExceeded { rounds: u32, missing: usize },
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("peer reported {code}: {error}")]
    Peer { code: ErrorCode, error: String },
    #[error("timed out after {waited:?} waiting for {phase}")]
    Timeout { phase: &'static str, waited: Duration },
    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Code reported to the peer when this error ends a transfer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::FailedCompress(_) => ErrorCode::FailedCompress,
            Self::FailedDeCompress(_) => ErrorCode::FailedDeCompress,
            Self::FailedFileOperations(_) | Self::Io(_) => ErrorCode::FailedFileOperations,
            Self::FailedCalcFileHash(_) => ErrorCode::FailedCalcFileHash,
            Self::LimitExceeded { .. } => ErrorCode::LimitExceeded,
            Self::FailedReceive(_)
            | Self::HashMismatch { .. }
            | Self::Peer { .. }
            | Self::Timeout { .. } => ErrorCode::FailedReceive,
        }
    }
}

/// Resolve a requested path inside `root`.
///
/// Only plain relative paths are accepted: absolute paths and any `..`
/// component are refused as not found, so nothing outside `root` can be
/// named.
pub fn resolve_shared(root: &Path, requested: &str) -> Result<PathBuf, TransferError> {
    let rel = Path::new(requested);
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::FileNotFound(requested.to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(TransferError::FileNotFound(requested.to_string()));
    }
    Ok(root.join(clean))
}

/// BLAKE3 of `data`, hex.
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
