//! QuickPort integration tests.
//!
//! Every test runs two peers inside the test process over loopback UDP.
//! Loss is injected by routing the data sockets through a relay that drops
//! chosen chunk frames:
//!
//!   cargo test --test integration

mod dispatch;
mod handshake;
mod infra;
mod transfer;

pub use infra::*;

pub use std::time::Duration;

pub use anyhow::Result;
pub use quickport_core::config::TransferSettings;
pub use quickport_core::{CompressionMode, Envelope};
pub use quickport_services::{get_file, SessionEvent, TransferError};
