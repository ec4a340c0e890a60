//! quickport-services: the networked half of QuickPort: handshake,
//! reliable transfer, liveness and the receive dispatcher, all on tokio.

pub mod address;
pub mod catalog;
pub mod chunk;
pub mod data;
pub mod dispatch;
pub mod event;
pub mod liveness;
pub mod net;
pub mod runtime;
pub mod session;
pub mod stun;

pub use chunk::{get_file, serve_file, TransferError};
pub use dispatch::{Dispatcher, PauseGate};
pub use event::SessionEvent;
pub use liveness::{AlertLevel, LivenessState};
pub use runtime::SessionRuntime;
pub use session::{connect, listen, AccessDecider, AccessRequest, Handle, HandshakeError, PeerConfig, SelfConfig};
