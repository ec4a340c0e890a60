use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use quickport_core::recovery::MissingPacketData;
use quickport_core::Datagram;
use quickport_services::net::bind_udp;
use quickport_services::{Dispatcher, Handle, PeerConfig, SelfConfig};

use crate::*;

pub const LOOPBACK: &str = "127.0.0.1:0";

/// Fresh loopback sockets for one side.
pub fn loopback_self(name: &str) -> SelfConfig {
    let any: SocketAddr = LOOPBACK.parse().unwrap();
    SelfConfig::new(name, bind_udp(any).unwrap(), bind_udp(any).unwrap()).unwrap()
}

pub fn peer_of(local: &SelfConfig) -> PeerConfig {
    PeerConfig {
        name: local.name.clone(),
        primary_addr: local.primary_addr,
        secondary_addr: local.secondary_addr,
    }
}

/// Transfer settings tuned for loopback so failure paths finish quickly.
pub fn fast_settings(share: &Path, downloads: &Path) -> TransferSettings {
    TransferSettings {
        chunk_timeout_ms: 300,
        missing_chunk_timeout_ms: 400,
        max_retries: 3,
        sender_idle_timeout_ms: 3_000,
        share_dir: share.to_path_buf(),
        download_dir: downloads.to_path_buf(),
        ..TransferSettings::default()
    }
}

/// Which chunk frames the relay drops on their way to the receiver.
#[derive(Debug, Clone)]
pub enum Loss {
    /// Drop each listed index the first time it is seen.
    FirstPass(HashSet<u32>),
    /// Drop every copy of each listed index.
    Always(HashSet<u32>),
}

/// Missing-list pages alice sent bob, in arrival order at the relay.
pub type Reports = Arc<Mutex<Vec<MissingPacketData>>>;

/// Two connected peers. `a` downloads, `b` serves, unless a test has
/// both do both.
pub struct Pair {
    pub a: Handle,
    pub b: Handle,
    pub dir: tempfile::TempDir,
    relay: Option<JoinHandle<()>>,
    reports: Reports,
}

impl Pair {
    /// Peers whose data sockets talk directly.
    pub fn direct() -> Self {
        let a = loopback_self("alice");
        let b = loopback_self("bob");
        let (peer_a, peer_b) = (peer_of(&a), peer_of(&b));
        Self::assemble(a, peer_b, b, peer_a, None, Reports::default())
    }

    /// Peers whose data sockets talk through a lossy relay.
    pub async fn relayed(loss: Loss) -> Self {
        let a = loopback_self("alice");
        let b = loopback_self("bob");

        // `toward_a` faces alice, `toward_b` faces bob.
        let toward_a = UdpSocket::bind(LOOPBACK).await.unwrap();
        let toward_b = UdpSocket::bind(LOOPBACK).await.unwrap();

        let peer_for_a = PeerConfig {
            secondary_addr: toward_a.local_addr().unwrap(),
            ..peer_of(&b)
        };
        let peer_for_b = PeerConfig {
            secondary_addr: toward_b.local_addr().unwrap(),
            ..peer_of(&a)
        };

        let reports = Reports::default();
        let relay = tokio::spawn(run_relay(
            toward_a,
            a.secondary_addr,
            toward_b,
            b.secondary_addr,
            loss,
            Arc::clone(&reports),
        ));
        Self::assemble(a, peer_for_a, b, peer_for_b, Some(relay), reports)
    }

    fn assemble(
        a: SelfConfig,
        a_sees: PeerConfig,
        b: SelfConfig,
        b_sees: PeerConfig,
        relay: Option<JoinHandle<()>>,
        reports: Reports,
    ) -> Self {
        let ping_timeout = Duration::from_secs(30);
        Self {
            a: Handle::new(a, a_sees, ping_timeout),
            b: Handle::new(b, b_sees, ping_timeout),
            dir: tempfile::tempdir().unwrap(),
            relay,
            reports,
        }
    }

    /// Missing-list pages seen by the relay so far. Always empty for
    /// direct pairs.
    pub fn missing_reports(&self) -> Vec<MissingPacketData> {
        self.reports.lock().unwrap().clone()
    }

    pub fn share_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("share")
    }

    pub fn download_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn settings(&self) -> TransferSettings {
        fast_settings(&self.share_dir(), &self.download_dir())
    }

    /// Put a file in the share directory. Both peers serve from it.
    pub fn share(&self, name: &str, content: &[u8]) {
        let path = self.share_dir().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Run bob's dispatcher until [`Serving::stop`].
    pub fn serve(&self) -> Serving {
        self.serve_as(&self.b)
    }

    /// Run the dispatcher of either side until [`Serving::stop`].
    pub fn serve_as(&self, side: &Handle) -> Serving {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, stop) = broadcast::channel(1);
        let dispatcher = Dispatcher::new(side.clone(), self.settings(), events_tx);
        let task = tokio::spawn(async move {
            dispatcher.run(stop).await.unwrap();
        });
        Serving {
            events,
            shutdown,
            task,
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

pub struct Serving {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Serving {
    /// Next event, or `None` after `wait`.
    pub async fn next_event(&mut self, wait: Duration) -> Option<SessionEvent> {
        tokio::time::timeout(wait, self.events.recv()).await.ok().flatten()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.unwrap();
    }
}

async fn run_relay(
    toward_a: UdpSocket,
    a_addr: SocketAddr,
    toward_b: UdpSocket,
    b_addr: SocketAddr,
    loss: Loss,
    reports: Reports,
) {
    let mut seen = HashSet::new();
    let mut from_a = vec![0u8; 65_536];
    let mut from_b = vec![0u8; 65_536];

    loop {
        tokio::select! {
            r = toward_a.recv_from(&mut from_a) => {
                let Ok((len, _)) = r else { return };
                let datagram = &from_a[..len];
                if let Ok(Datagram::Envelope(Envelope::PacketInfo(page))) = Datagram::parse(datagram) {
                    reports.lock().unwrap().push(page);
                }
                let _ = toward_b.send_to(datagram, b_addr).await;
            }
            r = toward_b.recv_from(&mut from_b) => {
                let Ok((len, _)) = r else { return };
                let frame = &from_b[..len];
                if should_drop(&loss, frame, &mut seen) {
                    continue;
                }
                let _ = toward_a.send_to(frame, a_addr).await;
            }
        }
    }
}

fn should_drop(loss: &Loss, frame: &[u8], seen: &mut HashSet<u32>) -> bool {
    let Ok(Datagram::Chunk(chunk)) = Datagram::parse(frame) else {
        return false;
    };
    match loss {
        Loss::Always(drop) => drop.contains(&chunk.index),
        Loss::FirstPass(drop) => drop.contains(&chunk.index) && seen.insert(chunk.index),
    }
}

/// Deterministic, poorly compressible test content.
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
