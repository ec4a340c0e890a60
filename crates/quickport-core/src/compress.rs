//! Compression adapter: payload transform applied to a whole file before
//! chunking and reversed after reassembly.
//!
//! | mode     | algorithm              |
//! |----------|------------------------|
//! | `none`   | identity               |
//! | `low`    | Snappy (raw format)    |
//! | `medium` | gzip, fastest level    |
//! | `high`   | zstd, level 19         |

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

const ZSTD_LEVEL: i32 = 19;

/// Compression mode requested by the receiver of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl CompressionMode {
    pub const ALL: [CompressionMode; 4] = [Self::None, Self::Low, Self::Medium, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionMode {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(CompressError::UnknownMode(other.to_string())),
        }
    }
}

/// Compress a complete payload.
pub fn compress(raw: &[u8], mode: CompressionMode) -> Result<Vec<u8>, CompressError> {
    let wrap = |source: io::Error| CompressError::Compress { mode, source };

    match mode {
        CompressionMode::None => Ok(raw.to_vec()),
        CompressionMode::Low => snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|e| wrap(io::Error::new(io::ErrorKind::InvalidInput, e))),
        CompressionMode::Medium => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
            encoder.write_all(raw).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        CompressionMode::High => zstd::stream::encode_all(raw, ZSTD_LEVEL).map_err(wrap),
    }
}

/// Reverse [`compress`]. The caller must pass the same mode.
pub fn decompress(data: &[u8], mode: CompressionMode) -> Result<Vec<u8>, CompressError> {
    let wrap = |source: io::Error| CompressError::Decompress { mode, source };

    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Low => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| wrap(io::Error::new(io::ErrorKind::InvalidData, e))),
        CompressionMode::Medium => {
            let mut out = Vec::new();
            GzDecoder::new(data).read_to_end(&mut out).map_err(wrap)?;
            Ok(out)
        }
        CompressionMode::High => zstd::stream::decode_all(data).map_err(wrap),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("unknown compression mode {0:?} (expected none, low, medium or high)")]
    UnknownMode(String),
    #[error("{mode} compression failed: {source}")]
    Compress {
        mode: CompressionMode,
        source: io::Error,
    },
    #[error("{mode} decompression failed: {source}")]
    Decompress {
        mode: CompressionMode,
        source: io::Error,
    },
}
