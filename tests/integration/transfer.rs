use std::collections::HashSet;

use quickport_core::message::{ControlMessage, ErrorCode, FileIndexData, FileRequestData};
use quickport_core::recovery::MissingPacketData;
use quickport_core::wire::encode_frame;
use quickport_core::Datagram;
use quickport_services::chunk::content_hash;
use quickport_services::net::{recv_datagram, send_envelope};
use quickport_services::{Handle, PeerConfig, SelfConfig};

use crate::*;

#[tokio::test]
async fn every_size_and_mode_arrives_intact() {
    let pair = Pair::direct();
    let settings = pair.settings();
    let mut serving = pair.serve();

    for size in [0usize, 1, 1400, 2 * 1400 + 1] {
        for mode in CompressionMode::ALL {
            let name = format!("f{size}-{mode}.bin");
            let content = pattern(size);
            pair.share(&name, &content);

            let got = get_file(&pair.a, &name, mode, &settings)
                .await
                .unwrap_or_else(|e| panic!("{name}: {e}"));
            assert_eq!(got.bytes, size as u64, "{name}");
            assert_eq!(std::fs::read(&got.path).unwrap(), content, "{name}");

            match serving.next_event(Duration::from_secs(2)).await {
                Some(SessionEvent::TransferServed { path, result }) => {
                    assert_eq!(path, name);
                    assert_eq!(result, Ok(got.chunks));
                }
                other => panic!("{name}: expected TransferServed, got {other:?}"),
            }
        }
    }

    serving.stop().await;
}

#[tokio::test]
async fn empty_file_needs_no_chunks() {
    let pair = Pair::direct();
    pair.share("empty", b"");
    let serving = pair.serve();

    let got = get_file(&pair.a, "empty", CompressionMode::None, &pair.settings())
        .await
        .unwrap();
    assert_eq!((got.bytes, got.chunks, got.rounds), (0, 0, 0));
    assert!(got.path.exists());

    serving.stop().await;
}

#[tokio::test]
async fn dropped_chunk_is_recovered() {
    let pair = Pair::relayed(Loss::FirstPass(HashSet::from([1]))).await;
    let content = pattern(3001);
    pair.share("three.bin", &content);
    let serving = pair.serve();

    let got = get_file(&pair.a, "three.bin", CompressionMode::None, &pair.settings())
        .await
        .unwrap();
    assert_eq!(got.chunks, 3);
    assert_eq!(got.rounds, 1);
    assert_eq!(std::fs::read(got.path).unwrap(), content);
    assert_eq!(
        pair.missing_reports(),
        vec![MissingPacketData {
            missing_chunks: vec![1],
            packet_index: 0,
            total_packets: 1,
        }]
    );

    serving.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_sides_pull_at_once() {
    let pair = Pair::direct();
    let from_bob = pattern(20 * 1400 + 7);
    let from_alice: Vec<u8> = pattern(9000).into_iter().rev().collect();
    pair.share("from-bob.bin", &from_bob);
    pair.share("from-alice.bin", &from_alice);
    let settings = pair.settings();

    let bob_serving = pair.serve();
    let alice_serving = pair.serve_as(&pair.a);

    let started = tokio::time::Instant::now();
    let (at_alice, at_bob) = tokio::join!(
        get_file(&pair.a, "from-bob.bin", CompressionMode::Low, &settings),
        get_file(&pair.b, "from-alice.bin", CompressionMode::None, &settings),
    );
    let at_alice = at_alice.unwrap();
    let at_bob = at_bob.unwrap();

    assert_eq!(std::fs::read(at_alice.path).unwrap(), from_bob);
    assert_eq!(std::fs::read(at_bob.path).unwrap(), from_alice);
    assert!(started.elapsed() < settings.sender_idle_timeout());

    bob_serving.stop().await;
    alice_serving.stop().await;
}

#[tokio::test]
async fn heavy_loss_recovers_across_pages() {
    // Every third chunk lost once, reported ten indices per page.
    let lost: HashSet<u32> = (0..60).step_by(3).collect();
    let pair = Pair::relayed(Loss::FirstPass(lost)).await;
    let content = pattern(60 * 1400);
    pair.share("big.bin", &content);
    let serving = pair.serve();

    let settings = TransferSettings {
        max_indices_per_page: 10,
        max_retries: 10,
        ..pair.settings()
    };
    let got = get_file(&pair.a, "big.bin", CompressionMode::None, &settings)
        .await
        .unwrap();
    assert_eq!(got.chunks, 60);
    assert!(got.rounds >= 1);
    assert_eq!(std::fs::read(got.path).unwrap(), content);

    serving.stop().await;
}

#[tokio::test]
async fn persistent_loss_exhausts_retries() {
    let pair = Pair::relayed(Loss::Always(HashSet::from([1]))).await;
    pair.share("three.bin", &pattern(3001));
    let mut serving = pair.serve();
    let settings = pair.settings();

    let err = get_file(&pair.a, "three.bin", CompressionMode::None, &settings)
        .await
        .unwrap_err();
    match err {
        TransferError::LimitExceeded { rounds, missing } => {
            assert_eq!(rounds, settings.max_retries);
            assert_eq!(missing, 1);
        }
        other => panic!("expected LimitExceeded, got {other}"),
    }
    assert!(!pair.download_dir().join("three.bin").exists());

    // The sender hears about it instead of waiting out its idle timeout.
    match serving.next_event(Duration::from_secs(2)).await {
        Some(SessionEvent::TransferServed { result: Err(e), .. }) => {
            assert!(e.contains("gave up"), "{e}");
        }
        other => panic!("expected a failed TransferServed, got {other:?}"),
    }

    serving.stop().await;
}

#[tokio::test]
async fn missing_file_is_reported_by_peer() {
    let pair = Pair::direct();
    std::fs::create_dir_all(pair.share_dir().join("dir")).unwrap();
    let serving = pair.serve();
    let settings = pair.settings();

    for path in ["nope.txt", "dir"] {
        let err = get_file(&pair.a, path, CompressionMode::None, &settings)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransferError::Peer { code: ErrorCode::FileNotFound, .. }),
            "{path}: {err}"
        );
    }

    serving.stop().await;
}

#[tokio::test]
async fn paths_outside_the_share_are_refused() {
    let pair = Pair::direct();
    std::fs::write(pair.dir.path().join("secret"), b"keep out").unwrap();
    let settings = pair.settings();

    for path in ["../secret", "/etc/passwd", ""] {
        let err = get_file(&pair.a, path, CompressionMode::None, &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)), "{path:?}: {err}");
    }
}

#[tokio::test]
async fn content_hash_mismatch_discards_output() {
    let alice = loopback_self("alice");
    let mallory = loopback_self("mallory");
    let alice_seen = peer_of(&alice);
    let a = Handle::new(alice, peer_of(&mallory), Duration::from_secs(30));

    let dir = tempfile::tempdir().unwrap();
    let downloads = dir.path().join("downloads");
    let settings = fast_settings(dir.path(), &downloads);

    let fake = tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

        let request = match recv_datagram(&mallory.primary, Some(alice_seen.primary_addr), deadline, &mut buf)
            .await
            .unwrap()
        {
            Some((Datagram::Envelope(Envelope::FileRequest(r)), _)) => r,
            other => panic!("expected a file request, got {other:?}"),
        };

        let body = b"not what was promised";
        let index = FileIndexData {
            file_path: request.file_path,
            total_size: body.len() as u64,
            chunk_count: 1,
            file_hash: content_hash(b"the promised content"),
            chunk_size: 1400,
        };
        send_envelope(&mallory.secondary, alice_seen.secondary_addr, &Envelope::FileIndex(index))
            .await
            .unwrap();

        loop {
            match recv_datagram(&mallory.secondary, Some(alice_seen.secondary_addr), deadline, &mut buf)
                .await
                .unwrap()
            {
                Some((Datagram::Envelope(Envelope::Message(ControlMessage::StartTransfer)), _)) => break,
                Some(_) => continue,
                None => panic!("no start signal"),
            }
        }
        mallory
            .secondary
            .send_to(&encode_frame(0, body).unwrap(), alice_seen.secondary_addr)
            .await
            .unwrap();

        loop {
            match recv_datagram(&mallory.secondary, Some(alice_seen.secondary_addr), deadline, &mut buf)
                .await
                .unwrap()
            {
                Some((Datagram::Envelope(Envelope::Message(ControlMessage::Finish(f))), _)) => return f,
                Some(_) => continue,
                None => panic!("no finish"),
            }
        }
    });

    let err = get_file(&a, "doc.txt", CompressionMode::None, &settings)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::HashMismatch { .. }), "{err}");
    assert!(!downloads.join("doc.txt").exists());

    let finish = fake.await.unwrap();
    assert!(!finish.success);
}

/// A peer answering with an index that would need absurd buffers.
async fn answer_with_index(
    peer: SelfConfig,
    requester: PeerConfig,
    total_size: u64,
    chunk_count: u32,
) -> Envelope {
    let mut buf = vec![0u8; 65_536];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    let request: FileRequestData =
        match recv_datagram(&peer.primary, Some(requester.primary_addr), deadline, &mut buf)
            .await
            .unwrap()
        {
            Some((Datagram::Envelope(Envelope::FileRequest(r)), _)) => r,
            other => panic!("expected a file request, got {other:?}"),
        };
    let index = FileIndexData {
        file_path: request.file_path,
        total_size,
        chunk_count,
        file_hash: content_hash(b""),
        chunk_size: 1400,
    };
    send_envelope(&peer.secondary, requester.secondary_addr, &Envelope::FileIndex(index))
        .await
        .unwrap();

    match recv_datagram(&peer.secondary, Some(requester.secondary_addr), deadline, &mut buf)
        .await
        .unwrap()
    {
        Some((Datagram::Envelope(reply), _)) => reply,
        other => panic!("expected a reply to the index, got {other:?}"),
    }
}

#[tokio::test]
async fn hostile_file_index_is_refused() {
    // A size whose chunk count wraps to 0 in 32 bits, and one that fits
    // but is far over the limit.
    for (total_size, chunk_count) in [(1400u64 << 53, 0u32), (1400 * u32::MAX as u64, u32::MAX)] {
        let alice = loopback_self("alice");
        let mallory = loopback_self("mallory");
        let alice_seen = peer_of(&alice);
        let a = Handle::new(alice, peer_of(&mallory), Duration::from_secs(30));

        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        let settings = fast_settings(dir.path(), &downloads);

        let fake = tokio::spawn(answer_with_index(mallory, alice_seen, total_size, chunk_count));

        let err = get_file(&a, "huge.iso", CompressionMode::None, &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FailedReceive(_)), "{total_size}: {err}");
        assert!(!downloads.join("huge.iso").exists());

        match fake.await.unwrap() {
            Envelope::Error(e) => assert_eq!(e.code, ErrorCode::FailedReceive),
            other => panic!("expected an error report, got {other:?}"),
        }
    }
}
