//! Envelope schema: every control message exchanged between two peers.
//!
//! An envelope is a closed tagged union encoded as JSON:
//!
//! ```text
//! {"kind":"FileRequest","payload":{"file_path":"notes.txt","compression":"low"}}
//! ```
//!
//! The tag is decided during deserialization, so a payload is only ever
//! decoded as the type its kind names. Chunk frames travel on the same
//! sockets but are raw binary records; [`Datagram::parse`] tells them apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compress::CompressionMode;
use crate::recovery::MissingPacketData;
use crate::wire::{decode_frame, ChunkFrame, WireError};

/// Catalog entry describing one shared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Path relative to the sharing peer's share directory.
    pub filename: String,
    pub size: u64,
    /// BLAKE3 of the file contents, hex.
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthFlag {
    AccessRequest,
    Allow,
    Deny,
}

/// Handshake payload. `secondary_port` is the sender's data socket port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMeta {
    pub name: String,
    pub secondary_port: u16,
    pub flag: AuthFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequestData {
    pub file_path: String,
    /// Absent on the wire means no compression.
    #[serde(default)]
    pub compression: CompressionMode,
}

/// Transfer descriptor sent by the file owner before streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexData {
    pub file_path: String,
    /// Size of the compressed payload in bytes.
    pub total_size: u64,
    pub chunk_count: u32,
    /// BLAKE3 of the uncompressed contents, hex.
    pub file_hash: String,
    pub chunk_size: u32,
}

impl FileIndexData {
    /// Expected data length of chunk `index`. Only the last chunk may be short.
    pub fn chunk_len(&self, index: u32) -> usize {
        if index >= self.chunk_count || self.chunk_size == 0 {
            return 0;
        }
        let start = index as u64 * self.chunk_size as u64;
        (self.total_size - start).min(self.chunk_size as u64) as usize
    }
}

/// `chunk_count` for a payload of `total_size` bytes, or `None` when the
/// count does not fit a `u32` or a non-empty payload has no chunk size.
pub fn chunk_count(total_size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return (total_size == 0).then_some(0);
    }
    u32::try_from(total_size.div_ceil(chunk_size as u64)).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishPacketData {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FileNotFound,
    FailedCompress,
    FailedDeCompress,
    FailedFileOperations,
    FailedCalcFileHash,
    FailedReceive,
    LimitExceeded,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FileNotFound => "file not found",
            Self::FailedCompress => "compression failed",
            Self::FailedDeCompress => "decompression failed",
            Self::FailedFileOperations => "file operation failed",
            Self::FailedCalcFileHash => "hashing failed",
            Self::FailedReceive => "receive failed",
            Self::LimitExceeded => "retry limit exceeded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPacketData {
    pub error: String,
    pub code: ErrorCode,
}

/// Body of a `Message` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "body")]
pub enum ControlMessage {
    /// Receiver is ready; the owner may begin streaming.
    StartTransfer,
    Finish(FinishPacketData),
    /// Free-form chat line.
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Envelope {
    SyncTray(Vec<FileMeta>),
    Auth(AuthMeta),
    Message(ControlMessage),
    FileRequest(FileRequestData),
    FileIndex(FileIndexData),
    File(FileMeta),
    PacketInfo(MissingPacketData),
    Ping,
    Error(ErrorPacketData),
}

/// Payload-free discriminant of [`Envelope`], for logging and phase checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    SyncTray,
    Auth,
    Message,
    FileRequest,
    FileIndex,
    File,
    PacketInfo,
    Ping,
    Error,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::SyncTray(_) => EnvelopeKind::SyncTray,
            Self::Auth(_) => EnvelopeKind::Auth,
            Self::Message(_) => EnvelopeKind::Message,
            Self::FileRequest(_) => EnvelopeKind::FileRequest,
            Self::FileIndex(_) => EnvelopeKind::FileIndex,
            Self::File(_) => EnvelopeKind::File,
            Self::PacketInfo(_) => EnvelopeKind::PacketInfo,
            Self::Ping => EnvelopeKind::Ping,
            Self::Error(_) => EnvelopeKind::Error,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::MalformedEnvelope(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(buf).map_err(|e| WireError::MalformedEnvelope(e.to_string()))
    }

    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Error(ErrorPacketData {
            error: error.into(),
            code,
        })
    }

    pub fn finish(success: bool, message: impl Into<String>) -> Self {
        Self::Message(ControlMessage::Finish(FinishPacketData {
            success,
            message: message.into(),
        }))
    }
}

/// Anything that can arrive on a peer socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Envelope(Envelope),
    Chunk(ChunkFrame),
}

impl Datagram {
    /// Classify a received datagram.
    ///
    /// Envelopes are JSON objects; anything that does not parse as one is
    /// tried as a chunk frame. A chunk whose first index byte happens to be
    /// `{` falls through to the frame decoder.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.first() == Some(&b'{') {
            if let Ok(envelope) = Envelope::decode(buf) {
                return Ok(Self::Envelope(envelope));
            }
        }
        decode_frame(buf).map(Self::Chunk)
    }
}
