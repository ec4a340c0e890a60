//! Configuration system for QuickPort.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $QUICKPORT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/quickport/config.toml
//!   3. ~/.config/quickport/config.toml

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::recovery::MAX_INDICES_PER_PAGE;
use crate::token::DEFAULT_TTL_SECS;
use crate::wire::MAX_CHUNK_DATA;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickPortConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferSettings,
    pub liveness: LivenessSettings,
    pub token: TokenSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name shown to the peer during the handshake.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local IP both sockets bind to.
    pub bind_ip: IpAddr,
    /// First port probed for the primary and secondary sockets. 0 = OS-assigned.
    pub base_port: u16,
    /// Last port probed.
    pub max_port: u16,
    /// STUN server queried when advertising a public address.
    pub stun_server: String,
    /// Put the STUN-mapped address in tokens instead of the LAN address.
    pub use_external_address: bool,
    /// How long the initiator waits for an auth response.
    pub handshake_timeout_secs: u64,
}

/// Default cap on a transfer's compressed payload: 4 GiB.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 4 << 30;

/// Tunables of the reliable chunk transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Data bytes per chunk. Capped at the wire maximum.
    pub chunk_size: u32,
    /// Per-read deadline during the first streaming pass.
    pub chunk_timeout_ms: u64,
    /// Deadline for retransmissions after each missing-list round.
    pub missing_chunk_timeout_ms: u64,
    /// Recovery rounds before the receiver gives up.
    pub max_retries: u32,
    pub max_indices_per_page: usize,
    /// Sender gives up when the receiver goes quiet this long.
    pub sender_idle_timeout_ms: u64,
    /// Largest compressed payload either side will hold in memory.
    pub max_file_bytes: u64,
    /// Directory served to the peer.
    pub share_dir: PathBuf,
    /// Directory downloads are written to.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub heartbeat_interval_secs: u64,
    /// Silence after which the first alert is raised.
    pub ping_timeout_secs: u64,
    pub watchdog_tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub ttl_secs: u64,
    /// zlib-wrap the token record before text encoding.
    pub compress: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: std::env::var("USER").unwrap_or_else(|_| "quickport".to_string()),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            base_port: 55190,
            max_port: 55199,
            stun_server: "stun.l.google.com:19302".to_string(),
            use_external_address: false,
            handshake_timeout_secs: 120,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_DATA as u32,
            chunk_timeout_ms: 1000,
            missing_chunk_timeout_ms: 3000,
            max_retries: 10,
            max_indices_per_page: MAX_INDICES_PER_PAGE,
            sender_idle_timeout_ms: 30_000,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            share_dir: PathBuf::from("."),
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            ping_timeout_secs: 30,
            watchdog_tick_ms: 1000,
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            compress: true,
        }
    }
}

impl TransferSettings {
    /// Chunk size clamped to `1..=MAX_CHUNK_DATA`.
    pub fn effective_chunk_size(&self) -> u32 {
        self.chunk_size.clamp(1, MAX_CHUNK_DATA as u32)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn missing_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.missing_chunk_timeout_ms)
    }

    pub fn sender_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_idle_timeout_ms)
    }
}

impl LivenessSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms.max(10))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("quickport")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl QuickPortConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            QuickPortConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("QUICKPORT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&QuickPortConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply QUICKPORT_* overrides. `lookup` is `std::env::var` outside tests.
    /// Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.trim().parse().ok())
        }
        fn flag(v: Option<String>) -> Option<bool> {
            v.map(|s| s == "true" || s == "1")
        }

        if let Some(v) = lookup("QUICKPORT_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_NETWORK__BIND_IP")) {
            self.network.bind_ip = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_NETWORK__BASE_PORT")) {
            self.network.base_port = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_NETWORK__MAX_PORT")) {
            self.network.max_port = v;
        }
        if let Some(v) = lookup("QUICKPORT_NETWORK__STUN_SERVER") {
            self.network.stun_server = v;
        }
        if let Some(v) = flag(lookup("QUICKPORT_NETWORK__USE_EXTERNAL_ADDRESS")) {
            self.network.use_external_address = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_TRANSFER__CHUNK_SIZE")) {
            self.transfer.chunk_size = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_TRANSFER__MAX_RETRIES")) {
            self.transfer.max_retries = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_TRANSFER__MAX_FILE_BYTES")) {
            self.transfer.max_file_bytes = v;
        }
        if let Some(v) = lookup("QUICKPORT_TRANSFER__SHARE_DIR") {
            self.transfer.share_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUICKPORT_TRANSFER__DOWNLOAD_DIR") {
            self.transfer.download_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(lookup("QUICKPORT_LIVENESS__PING_TIMEOUT_SECS")) {
            self.liveness.ping_timeout_secs = v;
        }
        if let Some(v) = parsed(lookup("QUICKPORT_TOKEN__TTL_SECS")) {
            self.token.ttl_secs = v;
        }
    }
}
