//! Events reported by background session tasks to whoever drives the UI.

use std::time::Duration;

use quickport_core::message::{ErrorPacketData, FileMeta};

use crate::liveness::AlertLevel;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// No heartbeat for `silent_for`; raised once per level.
    LivenessAlert { level: AlertLevel, silent_for: Duration },
    /// A heartbeat arrived after an alert.
    LivenessRestored,
    PeerError(ErrorPacketData),
    PeerMessage(String),
    PeerCatalog(Vec<FileMeta>),
    /// The peer announced a single newly shared file.
    PeerFile(FileMeta),
    /// A file the peer requested from us was served (or failed).
    TransferServed { path: String, result: Result<u32, String> },
}
