//! QuickPort wire format: the raw chunk frame.
//!
//! Bulk file data never travels inside an envelope. Each piece of a file is
//! sent as a fixed-layout binary record so the receive path can parse it
//! without a general-purpose decoder:
//!
//! ```text
//! [index:4 LE][length:4 LE][checksum:4 LE][data: length bytes]
//! ```
//!
//! The checksum is CRC-32/IEEE over `data`. Decoding does NOT verify it;
//! the transfer layer decides what to do with a corrupted frame.

use bytes::Bytes;
use crc::{Crc, CRC_32_ISO_HDLC};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Header preceding every chunk frame.
///
/// Wire size: 12 bytes. All integers are little-endian.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Zero-based chunk index within the transfer.
    pub index: U32<LittleEndian>,
    /// Number of data bytes following the header.
    pub length: U32<LittleEndian>,
    /// CRC-32/IEEE of the data bytes.
    pub checksum: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 12]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Maximum data bytes carried by one frame.
/// Keeps a full frame under a typical 1500-byte path MTU.
pub const MAX_CHUNK_DATA: usize = 1400;

/// Largest UDP payload we ever expect to receive.
pub const MAX_DATAGRAM: usize = 65_507;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32/IEEE of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A parsed chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub index: u32,
    pub length: u32,
    pub checksum: u32,
    pub data: Bytes,
}

impl ChunkFrame {
    /// True when the advertised checksum matches the data actually carried.
    pub fn is_intact(&self) -> bool {
        self.data.len() == self.length as usize && checksum(&self.data) == self.checksum
    }
}

/// Encode one chunk into a frame ready to send.
pub fn encode_frame(index: u32, data: &[u8]) -> Result<Vec<u8>, WireError> {
    if data.len() > MAX_CHUNK_DATA {
        return Err(WireError::PayloadTooLarge(data.len()));
    }

    let header = FrameHeader {
        index: U32::new(index),
        length: U32::new(data.len() as u32),
        checksum: U32::new(checksum(data)),
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Parse a frame. The checksum is returned as carried, not verified.
///
/// The length field is attacker-controlled, so it is checked against the
/// bytes actually present before anything is sliced.
pub fn decode_frame(buf: &[u8]) -> Result<ChunkFrame, WireError> {
    let header = FrameHeader::read_from_prefix(buf).ok_or(WireError::FrameTooShort(buf.len()))?;

    let length = header.length.get();
    let available = buf.len() - HEADER_LEN;
    if length as usize > available {
        return Err(WireError::FrameTruncated {
            expected: length as usize,
            available,
        });
    }

    Ok(ChunkFrame {
        index: header.index.get(),
        length,
        checksum: header.checksum.get(),
        data: Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + length as usize]),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes, header needs {}", HEADER_LEN)]
    FrameTooShort(usize),

    #[error("frame truncated: header claims {expected} data bytes, {available} present")]
    FrameTruncated { expected: usize, available: usize },

    #[error("chunk data length {0} exceeds maximum {}", MAX_CHUNK_DATA)]
    PayloadTooLarge(usize),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
