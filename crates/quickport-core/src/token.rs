//! Rendezvous token: the string one peer hands to the other out of band.
//!
//! Layout before text encoding:
//!
//! ```text
//! [marker:1][record]        marker 0x01 = record is zlib-compressed, 0x00 = raw
//! record = JSON {"v":1,"n":name,"i":ip,"p":port,"t":unix_secs,"s":[16 salt bytes]}
//! ```
//!
//! Every byte is then written as two letters from a 52-symbol alphabet
//! (`A-Z` then `a-z`): `alphabet[b / 52]` followed by `alphabet[b % 52]`.
//! The result survives copy/paste through any terminal.
//!
//! Tokens expire: a token older than the configured TTL (300 s by default)
//! is refused even if everything else is valid.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const ALPHABET: &[u8; 52] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub const TOKEN_VERSION: u8 = 1;
pub const DEFAULT_TTL_SECS: u64 = 300;

const MARKER_RAW: u8 = 0x00;
const MARKER_ZLIB: u8 = 0x01;

// ── 52-letter text encoding ───────────────────────────────────────────────────

pub fn encode52(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        out.push(ALPHABET[(b / 52) as usize] as char);
        out.push(ALPHABET[(b % 52) as usize] as char);
    }
    out
}

pub fn decode52(text: &str) -> Result<Vec<u8>, TokenError> {
    let raw = text.as_bytes();
    if raw.len() % 2 != 0 {
        return Err(TokenError::InvalidTokenLength(raw.len()));
    }

    let digit = |pos: usize| -> Result<usize, TokenError> {
        ALPHABET
            .iter()
            .position(|&c| c == raw[pos])
            .ok_or(TokenError::InvalidTokenCharacter { position: pos })
    };

    let mut out = Vec::with_capacity(raw.len() / 2);
    for pos in (0..raw.len()).step_by(2) {
        let value = digit(pos)? * 52 + digit(pos + 1)?;
        // Two letters can express up to 2703; only 0..=255 is a byte.
        let byte = u8::try_from(value).map_err(|_| TokenError::InvalidTokenCharacter { position: pos })?;
        out.push(byte);
    }
    Ok(out)
}

// ── Token record ──────────────────────────────────────────────────────────────

/// Decoded contents of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "i")]
    pub ip: IpAddr,
    #[serde(rename = "p")]
    pub port: u16,
    /// Issue time, seconds since the Unix epoch.
    #[serde(rename = "t")]
    pub timestamp: u64,
    /// Random salt so two tokens for the same endpoint never collide.
    #[serde(rename = "s")]
    pub salt: [u8; 16],
}

impl TokenData {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Generates and validates tokens.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    ttl_secs: u64,
    compress: bool,
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_SECS, true)
    }
}

impl TokenCodec {
    pub fn new(ttl_secs: u64, compress: bool) -> Self {
        Self { ttl_secs, compress }
    }

    pub fn generate(&self, name: &str, addr: SocketAddr) -> Result<String, TokenError> {
        self.generate_at(name, addr, unix_now())
    }

    pub fn generate_at(
        &self,
        name: &str,
        addr: SocketAddr,
        issued_at: u64,
    ) -> Result<String, TokenError> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let record = TokenData {
            version: TOKEN_VERSION,
            name: name.to_string(),
            ip: addr.ip(),
            port: addr.port(),
            timestamp: issued_at,
            salt,
        };
        let json = serde_json::to_vec(&record).map_err(|e| TokenError::Malformed(e.to_string()))?;

        let mut bytes = Vec::with_capacity(json.len() + 1);
        if self.compress {
            bytes.push(MARKER_ZLIB);
            let mut encoder = ZlibEncoder::new(bytes, flate2::Compression::best());
            encoder.write_all(&json).map_err(TokenError::Compress)?;
            bytes = encoder.finish().map_err(TokenError::Compress)?;
        } else {
            bytes.push(MARKER_RAW);
            bytes.extend_from_slice(&json);
        }

        Ok(encode52(&bytes))
    }

    pub fn parse(&self, token: &str) -> Result<TokenData, TokenError> {
        self.parse_at(token, unix_now())
    }

    /// Parse `token` as if the current time were `now`.
    pub fn parse_at(&self, token: &str, now: u64) -> Result<TokenData, TokenError> {
        let bytes = decode52(token.trim())?;
        let (marker, body) = bytes
            .split_first()
            .ok_or_else(|| TokenError::Malformed("empty token".into()))?;

        let json = match *marker {
            MARKER_RAW => body.to_vec(),
            MARKER_ZLIB => {
                let mut out = Vec::new();
                ZlibDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(TokenError::Decompress)?;
                out
            }
            other => {
                return Err(TokenError::Malformed(format!(
                    "unknown encoding marker {other:#04x}"
                )))
            }
        };

        let record: TokenData =
            serde_json::from_slice(&json).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if record.version != TOKEN_VERSION {
            return Err(TokenError::Malformed(format!(
                "unsupported token version {}",
                record.version
            )));
        }

        let age = now.saturating_sub(record.timestamp);
        if age > self.ttl_secs {
            return Err(TokenError::TokenExpired {
                age,
                ttl: self.ttl_secs,
            });
        }
        Ok(record)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token length {0}: must be even")]
    InvalidTokenLength(usize),
    #[error("invalid token character at position {position}")]
    InvalidTokenCharacter { position: usize },
    #[error("failed to compress token: {0}")]
    Compress(io::Error),
    #[error("failed to decompress token: {0}")]
    Decompress(io::Error),
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token expired: issued {age}s ago, valid for {ttl}s")]
    TokenExpired { age: u64, ttl: u64 },
}
