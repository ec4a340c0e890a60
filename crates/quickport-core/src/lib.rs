//! quickport-core: wire format, envelope schema, token codec and
//! configuration. No sockets, no runtime; every other QuickPort crate
//! depends on this one.

pub mod compress;
pub mod config;
pub mod message;
pub mod recovery;
pub mod token;
pub mod wire;

pub use compress::{CompressError, CompressionMode};
pub use config::QuickPortConfig;
pub use message::{Datagram, Envelope, EnvelopeKind, ErrorCode};
pub use token::{TokenCodec, TokenData, TokenError};
pub use wire::WireError;
