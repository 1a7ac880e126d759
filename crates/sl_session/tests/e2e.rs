//! End-to-end exercises over two stores and an in-memory bundle server.
//!
//! Envelopes travel by hand: what `encrypt` returns is fed straight into the
//! peer's `decrypt`, in whatever order the scenario calls for.

use std::sync::Arc;

use sl_session::testing::MemoryServer;
use sl_session::{
    replenish_tick, CoreConfig, KeyManager, SessionError, SessionManager, Transport,
};
use sl_store::{KeyStore, SessionStatus};

struct TestUser {
    _dir: tempfile::TempDir,
    store: KeyStore,
    keys: Arc<KeyManager>,
    transport: Arc<dyn Transport>,
    manager: SessionManager,
    config: CoreConfig,
}

async fn user(server: &Arc<MemoryServer>, name: &str, config: CoreConfig) -> TestUser {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = KeyStore::open(&dir.path().join("keys.db"), None)
        .await
        .expect("open store");
    let keys = KeyManager::new(store.clone(), config.clone());
    keys.initialize(name).await.expect("identity");
    let transport: Arc<dyn Transport> = Arc::new(server.client_for(name));
    let manager = SessionManager::new(store.clone(), keys.clone(), transport.clone(), config.clone());
    TestUser { _dir: dir, store, keys, transport, manager, config }
}

/// Small prekey targets so tests stay fast; protocol behaviour is unchanged.
fn small_config() -> CoreConfig {
    CoreConfig {
        one_time_prekey_target: 5,
        server_prekey_minimum: 3,
        max_upload_prekeys: 5,
        ..CoreConfig::default()
    }
}

async fn publish(u: &TestUser) {
    replenish_tick(&u.keys, u.transport.as_ref(), &u.config)
        .await
        .expect("replenish tick");
}

#[tokio::test]
async fn establish_roundtrip_and_opk_accounting() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    assert_eq!(server.one_time_prekey_count("bob"), 5);

    let alice = user(&server, "alice", small_config()).await;
    let info = alice.manager.ensure_session("bob").await.unwrap();
    assert_eq!(info.status, SessionStatus::Ready);
    // The bundle fetch spent one of Bob's server-side prekeys.
    assert_eq!(server.one_time_prekey_count("bob"), 4);

    // Idempotent once ready.
    let again = alice.manager.ensure_session("bob").await.unwrap();
    assert_eq!(again.session_id, info.session_id);

    let envelope = alice.manager.encrypt("bob", b"hello").await.unwrap();
    assert!(envelope.starts_with("E2EE:"));
    let plaintext = bob.manager.decrypt("alice", &envelope).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"hello");

    // Bob deleted the consumed prekey's secret: 4 usable remain locally.
    assert_eq!(bob.store.count_one_time_prekeys().await.unwrap(), 4);

    // Only the opening message carries the handshake prelude.
    let second = alice.manager.encrypt("bob", b"again").await.unwrap();
    let decoded = sl_proto::Envelope::decode(&second).unwrap();
    assert!(decoded.x3dh.is_none());
    assert_eq!(
        bob.manager.decrypt("alice", &second).await.unwrap().as_slice(),
        b"again"
    );

    // Both sides agree on the peer fingerprint.
    let alice_view = alice.store.load_session("bob").await.unwrap().unwrap();
    let bob_view = bob.store.load_session("alice").await.unwrap().unwrap();
    assert!(alice_view.remote_fingerprint.is_some());
    assert_eq!(
        bob_view.remote_fingerprint.as_deref(),
        Some(alice.keys.identity().await.unwrap().fingerprint().as_str())
    );
}

#[tokio::test]
async fn arbitrary_delivery_order_recovers_every_message() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    let mut sent = Vec::new();
    for i in 0..5u8 {
        sent.push(alice.manager.encrypt("bob", &[b'm', i]).await.unwrap());
    }

    // M3, M1, M5, M4, M2
    for &i in &[2usize, 0, 4, 3, 1] {
        let plaintext = bob.manager.decrypt("alice", &sent[i]).await.unwrap();
        assert_eq!(plaintext.as_slice(), &[b'm', i as u8]);
    }

    let rec = bob.store.load_session("alice").await.unwrap().unwrap();
    assert_eq!(rec.ratchet.as_ref().unwrap().skipped_len(), 0);
}

#[tokio::test]
async fn ping_pong_ratchets_and_survives_reload() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    let m1 = alice.manager.encrypt("bob", b"m1").await.unwrap();
    assert_eq!(bob.manager.decrypt("alice", &m1).await.unwrap().as_slice(), b"m1");

    // Bob's reply rides the session his decrypt established.
    let r1 = bob.manager.encrypt("alice", b"r1").await.unwrap();
    let r1_decoded = sl_proto::Envelope::decode(&r1).unwrap();
    assert!(r1_decoded.x3dh.is_none(), "responder never sends a prelude");
    assert_eq!(r1_decoded.header.pn, 0, "bob had no previous sending chain");
    assert_eq!(alice.manager.decrypt("bob", &r1).await.unwrap().as_slice(), b"r1");

    // Alice's next message opens a fresh chain; her previous one held m1.
    let m2 = alice.manager.encrypt("bob", b"m2").await.unwrap();
    let m2_decoded = sl_proto::Envelope::decode(&m2).unwrap();
    assert_eq!((m2_decoded.header.pn, m2_decoded.header.n), (1, 0));
    assert_eq!(bob.manager.decrypt("alice", &m2).await.unwrap().as_slice(), b"m2");

    // Cold restart on Bob's side: reopen the store, rebuild the stack.
    bob.store.close().await;
    let store2 = KeyStore::open(&bob._dir.path().join("keys.db"), None)
        .await
        .unwrap();
    let keys2 = KeyManager::new(store2.clone(), bob.config.clone());
    let transport2: Arc<dyn Transport> = Arc::new(server.client_for("bob"));
    let manager2 = SessionManager::new(store2, keys2, transport2, bob.config.clone());

    let m3 = alice.manager.encrypt("bob", b"m3").await.unwrap();
    assert_eq!(manager2.decrypt("alice", &m3).await.unwrap().as_slice(), b"m3");
}

#[tokio::test]
async fn skipped_key_table_is_bounded_with_fifo_eviction() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    // 2002 messages; Bob receives only the odd-numbered ones, so every even
    // key lands in the skipped table: 1001 candidates for a 1000-slot cache.
    let mut sent = Vec::with_capacity(2002);
    for i in 0..2002u32 {
        sent.push(
            alice
                .manager
                .encrypt("bob", format!("m{i}").as_bytes())
                .await
                .unwrap(),
        );
    }
    for (i, env) in sent.iter().enumerate() {
        if i % 2 == 1 {
            let plaintext = bob.manager.decrypt("alice", env).await.unwrap();
            assert_eq!(plaintext.as_slice(), format!("m{i}").as_bytes());
        }
    }

    let rec = bob.store.load_session("alice").await.unwrap().unwrap();
    assert_eq!(rec.ratchet.as_ref().unwrap().skipped_len(), 1000);

    // The oldest skipped key (message 0) was evicted…
    assert!(matches!(
        bob.manager.decrypt("alice", &sent[0]).await,
        Err(SessionError::DecryptionFailed)
    ));
    // …while the next-oldest still decrypts.
    assert_eq!(
        bob.manager.decrypt("alice", &sent[2]).await.unwrap().as_slice(),
        b"m2"
    );
}

#[tokio::test]
async fn bundle_without_one_time_prekey_still_establishes() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;

    // Publish only identity + signed prekey: no OPKs anywhere.
    bob.keys.current_signed_prekey().await.unwrap();
    let bundle = bob.keys.pending_bundle().await.unwrap().unwrap();
    assert!(bundle.one_time_prekeys.is_empty());
    bob.transport.upload_prekeys(&bundle).await.unwrap();
    bob.keys.mark_bundle_uploaded(&bundle).await.unwrap();

    let alice = user(&server, "alice", small_config()).await;
    alice.manager.ensure_session("bob").await.unwrap();

    let rec = alice.store.load_session("bob").await.unwrap().unwrap();
    assert_eq!(rec.used_one_time_prekey_id, None);

    let env = alice.manager.encrypt("bob", b"no opk").await.unwrap();
    assert_eq!(bob.manager.decrypt("alice", &env).await.unwrap().as_slice(), b"no opk");
}

#[tokio::test]
async fn duplicate_delivery_fails_cleanly_without_corrupting_state() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    let m1 = alice.manager.encrypt("bob", b"m1").await.unwrap();
    assert_eq!(bob.manager.decrypt("alice", &m1).await.unwrap().as_slice(), b"m1");

    assert!(matches!(
        bob.manager.decrypt("alice", &m1).await,
        Err(SessionError::DecryptionFailed)
    ));

    // The failed duplicate left the session fully usable.
    let m2 = alice.manager.encrypt("bob", b"m2").await.unwrap();
    assert_eq!(bob.manager.decrypt("alice", &m2).await.unwrap().as_slice(), b"m2");
}

#[tokio::test]
async fn replayed_handshake_cannot_respend_the_prekey() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    let opening = alice.manager.encrypt("bob", b"hello").await.unwrap();
    bob.manager.decrypt("alice", &opening).await.unwrap();

    // The same opening message replayed under another peer id references an
    // already-spent one-time prekey.
    assert!(matches!(
        bob.manager.decrypt("alice-imposter", &opening).await,
        Err(SessionError::OpkAlreadyConsumed(_))
    ));
}

#[tokio::test]
async fn identity_reset_surfaces_a_mismatch_to_the_peer() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    let m1 = alice.manager.encrypt("bob", b"m1").await.unwrap();
    bob.manager.decrypt("alice", &m1).await.unwrap();

    // Alice burns her identity and re-publishes; her sessions are gone.
    alice.keys.reset_identity("alice").await.unwrap();
    publish(&alice).await;
    assert!(alice.store.load_session("bob").await.unwrap().is_none());

    // Her next message carries a prelude under the new identity key. Bob
    // still pins the old one and must not auto-accept.
    let m2 = alice.manager.encrypt("bob", b"m2").await.unwrap();
    match bob.manager.decrypt("alice", &m2).await {
        Err(SessionError::IdentityMismatch { peer, stored, presented }) => {
            assert_eq!(peer, "alice");
            assert_ne!(stored, presented);
        }
        other => panic!("expected IdentityMismatch, got {other:?}"),
    }

    // Out-of-band re-verification maps to dropping the pinned session.
    bob.manager.delete_session("alice").await.unwrap();
    assert_eq!(bob.manager.decrypt("alice", &m2).await.unwrap().as_slice(), b"m2");
}

#[tokio::test]
async fn decrypt_without_session_or_prelude_is_session_not_found() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    let m1 = alice.manager.encrypt("bob", b"m1").await.unwrap();
    bob.manager.decrypt("alice", &m1).await.unwrap();
    // A later (prelude-free) message shows up attributed to a stranger.
    let m2 = alice.manager.encrypt("bob", b"m2").await.unwrap();
    assert!(matches!(
        bob.manager.decrypt("carol", &m2).await,
        Err(SessionError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn over_eager_skip_is_refused_but_session_survives() {
    let config = CoreConfig { max_skipped: 10, ..small_config() };
    let server = MemoryServer::new();
    let bob = user(&server, "bob", config.clone()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", config).await;

    let mut sent = Vec::new();
    for i in 0..12u8 {
        sent.push(alice.manager.encrypt("bob", &[i]).await.unwrap());
    }

    // Message 11 alone would require caching 11 skipped keys.
    assert!(matches!(
        bob.manager.decrypt("alice", &sent[11]).await,
        Err(SessionError::TooManySkipped)
    ));
    // The refusal did not touch state: in-order delivery still works.
    assert_eq!(bob.manager.decrypt("alice", &sent[0]).await.unwrap().as_slice(), &[0]);
}

#[tokio::test]
async fn replenishment_policy_tops_up_and_rotates() {
    let server = MemoryServer::new();
    let config = small_config();
    let bob = user(&server, "bob", config.clone()).await;

    // First tick: everything is missing, so SPK + full OPK batch upload.
    publish(&bob).await;
    assert_eq!(server.one_time_prekey_count("bob"), 5);
    let spk_before = bob.store.load_current_signed_prekey().await.unwrap().unwrap();

    // Healthy state: a tick changes nothing.
    publish(&bob).await;
    assert_eq!(server.one_time_prekey_count("bob"), 5);

    // Three bundle fetches drain the server below the minimum of 3.
    let alice_transport = server.client_for("alice");
    for _ in 0..3 {
        alice_transport.fetch_bundle("bob").await.unwrap();
    }
    assert_eq!(server.one_time_prekey_count("bob"), 2);

    publish(&bob).await;
    assert_eq!(server.one_time_prekey_count("bob"), 5, "topped back up to target");

    // Age the signed prekey past its TTL; the next tick rotates it.
    server.age_signed_prekey("bob", chrono::Duration::days(8));
    publish(&bob).await;
    let spk_after = bob.store.load_current_signed_prekey().await.unwrap().unwrap();
    assert!(spk_after.key_id > spk_before.key_id, "prekey ids only grow");
    assert!(spk_after.uploaded);
}

#[tokio::test]
async fn replenish_loop_runs_and_shuts_down() {
    let config = CoreConfig {
        status_poll_interval: std::time::Duration::from_secs(3600),
        ..small_config()
    };
    let server = MemoryServer::new();
    let bob = user(&server, "bob", config).await;

    let handle = bob.manager.start_replenishment();
    // The startup tick populates the server without waiting for the timer.
    for _ in 0..50 {
        if server.one_time_prekey_count("bob") == 5 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(server.one_time_prekey_count("bob"), 5);
    handle.shutdown().await;
}

#[tokio::test]
async fn rotation_keeps_in_flight_handshakes_decryptable() {
    let server = MemoryServer::new();
    let bob = user(&server, "bob", small_config()).await;
    publish(&bob).await;
    let alice = user(&server, "alice", small_config()).await;

    // Alice fetches Bob's bundle and prepares her opening message…
    let opening = alice.manager.encrypt("bob", b"early bird").await.unwrap();

    // …but before it arrives, Bob rotates his signed prekey.
    bob.keys.rotate_signed_prekey().await.unwrap();
    publish(&bob).await;

    // The old SPK is retained in storage, so the handshake still lands.
    assert_eq!(
        bob.manager.decrypt("alice", &opening).await.unwrap().as_slice(),
        b"early bird"
    );
}
