use quickport_core::TokenCodec;
use quickport_services::catalog::{exchange_catalogs, list_catalog, Role};
use quickport_services::{connect, listen, AccessRequest};

use crate::*;

/// Refused once, admitted on the second try, found through a token.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refusal_then_admission_via_token() {
    let bob = loopback_self("bob");
    let alice = loopback_self("alice");
    let (bob_secondary, alice_seen) = (bob.secondary_addr, peer_of(&alice));

    let codec = TokenCodec::default();
    let token = codec.generate(&bob.name, bob.primary_addr).unwrap();

    let host = tokio::spawn(async move {
        let mut asked = 0u32;
        let mut decider = move |req: &AccessRequest| -> anyhow::Result<bool> {
            asked += 1;
            assert_eq!(req.name, "alice");
            Ok(asked > 1)
        };
        let peer = listen(&bob, &mut decider, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        (bob, peer)
    });

    let target = codec.parse(&token).unwrap();
    assert_eq!(target.name, "bob");

    let refused = connect(&alice, target.addr(), Duration::from_secs(5)).await.unwrap();
    assert!(refused.is_none());

    let admitted = connect(&alice, target.addr(), Duration::from_secs(5))
        .await
        .unwrap()
        .expect("second request should be allowed");
    assert_eq!(admitted.name, "bob");
    assert_eq!(admitted.primary_addr, target.addr());
    assert_eq!(admitted.secondary_addr, bob_secondary);

    let (_bob, seen_by_bob) = host.await.unwrap();
    assert_eq!(seen_by_bob, alice_seen);
}

#[tokio::test]
async fn catalogs_swap_in_both_directions() {
    let alice = loopback_self("alice");
    let bob = loopback_self("bob");
    let (alice_seen, bob_seen) = (peer_of(&alice), peer_of(&bob));

    let shares = tempfile::tempdir().unwrap();
    let alice_dir = shares.path().join("alice");
    let bob_dir = shares.path().join("bob");
    std::fs::create_dir_all(alice_dir.join("notes")).unwrap();
    std::fs::create_dir_all(&bob_dir).unwrap();
    std::fs::write(alice_dir.join("notes").join("todo.md"), b"- ship").unwrap();
    std::fs::write(bob_dir.join("song.ogg"), pattern(5000)).unwrap();

    let alice_files = list_catalog(&alice_dir).unwrap();
    let bob_files = list_catalog(&bob_dir).unwrap();
    let wait = Duration::from_secs(3);

    let (at_alice, at_bob) = tokio::join!(
        exchange_catalogs(&alice, &bob_seen, Role::Joiner, alice_files.clone(), wait),
        exchange_catalogs(&bob, &alice_seen, Role::Host, bob_files.clone(), wait),
    );

    assert_eq!(at_alice.unwrap(), bob_files);
    assert_eq!(at_bob.unwrap(), alice_files);
    assert_eq!(bob_files[0].filename, "song.ogg");
    assert_eq!(alice_files[0].filename, "notes/todo.md");
}
