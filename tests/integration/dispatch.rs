use tokio::sync::broadcast;
use tokio::time::Instant;

use quickport_core::message::{ControlMessage, ErrorCode, FileMeta};
use quickport_core::Datagram;
use quickport_services::liveness::heartbeat_loop;
use quickport_services::net::{recv_datagram, send_envelope};

use crate::*;

const QUIET: Duration = Duration::from_millis(600);
const PROMPT: Duration = Duration::from_secs(2);

async fn from_alice(pair: &Pair, envelope: Envelope) {
    send_envelope(&pair.a.local.primary, pair.b.local.primary_addr, &envelope)
        .await
        .unwrap();
}

fn text(s: &str) -> Envelope {
    Envelope::Message(ControlMessage::Text(s.to_string()))
}

#[tokio::test]
async fn pause_gate_holds_back_chat_but_not_errors() {
    let pair = Pair::direct();
    let mut serving = pair.serve();

    let guard = pair.b.pause.pause();
    from_alice(&pair, text("while paused")).await;
    assert_eq!(serving.next_event(QUIET).await, None);

    from_alice(&pair, Envelope::error(ErrorCode::FailedReceive, "boom")).await;
    match serving.next_event(PROMPT).await {
        Some(SessionEvent::PeerError(e)) => {
            assert_eq!(e.code, ErrorCode::FailedReceive);
            assert_eq!(e.error, "boom");
        }
        other => panic!("expected PeerError, got {other:?}"),
    }

    drop(guard);
    assert!(!pair.b.pause.is_paused());
    from_alice(&pair, text("hello bob")).await;
    assert_eq!(
        serving.next_event(PROMPT).await,
        Some(SessionEvent::PeerMessage("hello bob".into()))
    );

    serving.stop().await;
}

#[tokio::test]
async fn file_requests_are_served_while_paused() {
    let pair = Pair::direct();
    let content = pattern(4000);
    pair.share("report.pdf", &content);
    let mut serving = pair.serve();

    let _guard = pair.b.pause.pause();
    let got = get_file(&pair.a, "report.pdf", CompressionMode::Medium, &pair.settings())
        .await
        .unwrap();
    assert_eq!(std::fs::read(got.path).unwrap(), content);

    assert_eq!(
        serving.next_event(PROMPT).await,
        Some(SessionEvent::TransferServed {
            path: "report.pdf".into(),
            result: Ok(got.chunks),
        })
    );

    serving.stop().await;
}

#[tokio::test]
async fn catalog_announcements_become_events() {
    let pair = Pair::direct();
    let mut serving = pair.serve();

    let meta = FileMeta {
        filename: "new.txt".into(),
        size: 3,
        hash: "ab".repeat(32),
    };
    from_alice(&pair, Envelope::SyncTray(vec![meta.clone()])).await;
    assert_eq!(
        serving.next_event(PROMPT).await,
        Some(SessionEvent::PeerCatalog(vec![meta.clone()]))
    );

    from_alice(&pair, Envelope::File(meta.clone())).await;
    assert_eq!(serving.next_event(PROMPT).await, Some(SessionEvent::PeerFile(meta)));

    serving.stop().await;
}

#[tokio::test]
async fn heartbeats_count_even_while_paused() {
    let pair = Pair::direct();
    let serving = pair.serve();
    let _guard = pair.b.pause.pause();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(pair.b.liveness.silent_for() >= Duration::from_millis(400));

    from_alice(&pair, Envelope::Ping).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pair.b.liveness.silent_for() < Duration::from_millis(400));

    serving.stop().await;
}

#[tokio::test]
async fn heartbeat_stops_while_paused() {
    let pair = Pair::direct();
    let (shutdown, stop) = broadcast::channel(1);
    let guard = pair.a.pause.pause();
    let beat = tokio::spawn(heartbeat_loop(pair.a.clone(), Duration::from_millis(50), stop));

    let bob = &pair.b.local.primary;
    let alice = Some(pair.a.local.primary_addr);
    let mut buf = vec![0u8; 2048];

    let quiet = recv_datagram(bob, alice, Instant::now() + QUIET, &mut buf).await.unwrap();
    assert!(quiet.is_none(), "pinged while paused: {quiet:?}");

    drop(guard);
    let ping = recv_datagram(bob, alice, Instant::now() + PROMPT, &mut buf).await.unwrap();
    assert!(matches!(ping, Some((Datagram::Envelope(Envelope::Ping), _))), "{ping:?}");

    shutdown.send(()).unwrap();
    beat.await.unwrap();
}

#[tokio::test]
async fn strangers_are_ignored() {
    let pair = Pair::direct();
    let mut serving = pair.serve();

    let stranger = loopback_self("eve");
    send_envelope(&stranger.primary, pair.b.local.primary_addr, &text("let me in"))
        .await
        .unwrap();
    assert_eq!(serving.next_event(QUIET).await, None);

    serving.stop().await;
}
