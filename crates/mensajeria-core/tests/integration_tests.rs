//! Integration tests for end-to-end messaging scenarios.
//!
//! These drive the public API only: crypto envelopes, signed protocol
//! envelopes, and the chat engine over both persistence gateways.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use mensajeria_core::config::{ChatConfig, EngineConfig, SigningSecret, WritePolicy};
use mensajeria_core::crypto::{decrypt, encrypt, AlgorithmId};
use mensajeria_core::messaging::{
    Accepted, ChatEngine, ChatId, ManualClock, MessageRange, UserId,
};
use mensajeria_core::protocol::{
    ProtocolEnvelope, ProtocolPayload, StatusEvent, StatusKind,
};
use mensajeria_core::storage::{MemoryStore, SessionStore, SqliteConfig, SqliteStore};
use mensajeria_core::Error;

const PASSWORD: &str = "secret123";

fn engine_config(capacity: usize, write_policy: WritePolicy) -> EngineConfig {
    EngineConfig {
        cache_capacity: NonZeroUsize::new(capacity).expect("capacity"),
        write_policy,
        signing_secret: SigningSecret::new(b"shared integration secret".to_vec()).expect("secret"),
        ..Default::default()
    }
}

fn memory_engine(
    capacity: usize,
    write_policy: WritePolicy,
) -> (Arc<MemoryStore>, Arc<ManualClock>, Arc<ChatEngine>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let engine = Arc::new(ChatEngine::with_clock(
        store.clone(),
        engine_config(capacity, write_policy),
        clock.clone(),
    ));
    (store, clock, engine)
}

async fn create_chat(engine: &ChatEngine, users: &[i64], config: ChatConfig) -> ChatId {
    let users: Vec<UserId> = users.iter().copied().map(UserId).collect();
    engine.create_chat(&users, config).await.expect("create chat").chat_id
}

/// "hola" under "secret123" round-trips; "wrong" fails closed.
#[test]
fn test_envelope_round_trip_and_wrong_password() {
    let envelope = encrypt(b"hola", PASSWORD, AlgorithmId::Aes256Gcm, None).expect("encrypt");

    let plaintext = decrypt(&envelope, PASSWORD, None).expect("decrypt");
    assert_eq!(&plaintext[..], b"hola");

    assert!(matches!(
        decrypt(&envelope, "wrong", None),
        Err(Error::DecryptionFailed)
    ));
}

/// Protocol envelopes verify under the right secret only, and any single
/// byte change is rejected.
#[test]
fn test_protocol_envelope_tamper_detection() {
    let secret = SigningSecret::new(b"alice and bob".to_vec()).expect("secret");
    let other = SigningSecret::new(b"mallory".to_vec()).expect("secret");
    let event = StatusEvent {
        kind: StatusKind::Typing,
        user_id: 7,
        chat_id: Some(3),
    };

    let bytes = ProtocolEnvelope::sign_payload(&event, &secret)
        .expect("sign")
        .to_bytes();
    assert!(ProtocolEnvelope::verify_bytes(&bytes, &secret));
    assert!(!ProtocolEnvelope::verify_bytes(&bytes, &other));

    let verified = ProtocolEnvelope::open(&bytes, &secret).expect("open");
    assert!(matches!(verified.payload(), ProtocolPayload::StatusEvent(e) if *e == event));

    for i in 0..bytes.len() {
        let mut tampered = bytes.clone();
        tampered[i] ^= 0x01;
        assert!(!ProtocolEnvelope::verify_bytes(&tampered, &secret), "byte {}", i);
        assert!(matches!(
            ProtocolEnvelope::open(&tampered, &secret),
            Err(Error::MalformedEnvelope)
        ));
    }
}

/// End-to-end: send, read back, wrong password fails per message.
#[tokio::test]
async fn test_engine_send_and_read() {
    let (_, _, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(&engine, &[1, 2], ChatConfig::default()).await;

    engine
        .send_message(chat_id, UserId(1), b"hola", PASSWORD)
        .await
        .expect("send");
    engine
        .send_message(chat_id, UserId(2), b"que tal", PASSWORD)
        .await
        .expect("send");

    let page = engine
        .get_messages(chat_id, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    let texts: Vec<_> = page.iter().filter_map(|m| m.text()).collect();
    assert_eq!(texts, vec!["hola", "que tal"]);

    let wrong = engine
        .get_messages(chat_id, "wrong", MessageRange::default())
        .await
        .expect("read");
    assert_eq!(wrong.len(), 2);
    assert!(wrong
        .iter()
        .all(|m| matches!(m.plaintext, Err(Error::DecryptionFailed))));
}

/// With auto-delete disabled nothing ever expires.
#[tokio::test]
async fn test_no_ttl_never_expires() {
    let (store, clock, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(
        &engine,
        &[1, 2],
        ChatConfig {
            auto_delete_hours: 0,
            ..Default::default()
        },
    )
    .await;

    let sent = engine
        .send_message(chat_id, UserId(1), b"forever", PASSWORD)
        .await
        .expect("send");
    assert_eq!(sent.delete_at, None);

    clock.advance(chrono::Duration::days(3650));
    assert_eq!(engine.cleanup_expired_messages().await.expect("cleanup"), 0);
    assert_eq!(store.message_count(chat_id), 1);

    let page = engine
        .get_messages(chat_id, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    assert_eq!(page.len(), 1);
}

/// Expired messages vanish from reads at once, and from cache and store on
/// the next sweep.
#[tokio::test]
async fn test_expiry_removes_from_cache_and_store() {
    let (store, clock, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(
        &engine,
        &[1, 2],
        ChatConfig {
            auto_delete_hours: 1,
            ..Default::default()
        },
    )
    .await;

    let doomed = engine
        .send_message(chat_id, UserId(1), b"doomed", PASSWORD)
        .await
        .expect("send");
    assert_eq!(
        doomed.delete_at,
        Some(doomed.created_at + chrono::Duration::hours(1))
    );

    clock.advance(chrono::Duration::minutes(61));
    engine.set_auto_delete(chat_id, 0).await.expect("disable ttl");
    engine
        .send_message(chat_id, UserId(2), b"survivor", PASSWORD)
        .await
        .expect("send");

    let page = engine
        .get_messages(chat_id, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    let texts: Vec<_> = page.iter().filter_map(|m| m.text()).collect();
    assert_eq!(texts, vec!["survivor"]);

    assert_eq!(engine.cleanup_expired_messages().await.expect("cleanup"), 1);
    assert!(!store.contains_message(&doomed.message_id));
    assert_eq!(store.message_count(chat_id), 1);
    assert_eq!(
        engine.chat_info(chat_id).await.expect("info").cached_messages,
        1
    );

    assert_eq!(engine.cleanup_expired_messages().await.expect("cleanup"), 0);
}

/// Capacity 2: loading A, B, C evicts A; touching A again reloads it.
#[tokio::test]
async fn test_lru_eviction_order() {
    let (store, _, engine) = memory_engine(2, WritePolicy::WriteThrough);
    let a = create_chat(&engine, &[1], ChatConfig::default()).await;
    let b = create_chat(&engine, &[2], ChatConfig::default()).await;
    let c = create_chat(&engine, &[3], ChatConfig::default()).await;

    engine.get_or_load(a).await.expect("load a");
    engine.get_or_load(b).await.expect("load b");
    engine.get_or_load(c).await.expect("load c");
    assert_eq!(store.session_loads(), 3);
    assert_eq!(engine.resident_count(), 2);
    assert!(!engine.is_resident(a));
    assert!(engine.is_resident(b));
    assert!(engine.is_resident(c));

    engine.get_or_load(a).await.expect("reload a");
    assert_eq!(store.session_loads(), 4);
    assert!(!engine.is_resident(b));

    engine.get_or_load(c).await.expect("hit c");
    assert_eq!(store.session_loads(), 4);
}

/// The resident count never exceeds capacity, whatever the access pattern.
#[tokio::test]
async fn test_capacity_invariant() {
    let (_, _, engine) = memory_engine(3, WritePolicy::WriteBack);
    let mut chats = Vec::new();
    for user in 1..=8 {
        chats.push(create_chat(&engine, &[user], ChatConfig::default()).await);
    }

    for step in 0..40usize {
        let chat_id = chats[(step * 5 + step / 3) % chats.len()];
        engine.get_or_load(chat_id).await.expect("load");
        assert!(engine.resident_count() <= 3);
    }
}

/// Concurrent loads of one uncached chat share a single gateway load.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_load() {
    let (store, _, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(&engine, &[1, 2], ChatConfig::default()).await;
    store.set_load_delay(Some(Duration::from_millis(100)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get_or_load(chat_id).await })
        })
        .collect();
    for task in tasks {
        let session = task.await.expect("join").expect("load");
        assert_eq!(session.chat_id, chat_id);
    }

    assert_eq!(store.session_loads(), 1);
    assert_eq!(engine.resident_count(), 1);
}

/// Two concurrent sends on one chat both land, in seq order, intact.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends() {
    let (_, _, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(&engine, &[1, 2], ChatConfig::default()).await;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .send_message(chat_id, UserId(1), b"from alice", PASSWORD)
                .await
        })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .send_message(chat_id, UserId(2), b"from bob", PASSWORD)
                .await
        })
    };
    let first = first.await.expect("join").expect("send");
    let second = second.await.expect("join").expect("send");
    assert_ne!(first.seq, second.seq);

    let page = engine
        .get_messages(chat_id, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    assert_eq!(page.len(), 2);
    assert!(page[0].record.seq < page[1].record.seq);

    let mut texts: Vec<_> = page.iter().filter_map(|m| m.text()).collect();
    let expected_first = if first.seq < second.seq {
        "from alice"
    } else {
        "from bob"
    };
    assert_eq!(texts[0], expected_first);
    texts.sort_unstable();
    assert_eq!(texts, vec!["from alice", "from bob"]);
}

/// A dirty entry whose flush fails is never evicted; the load that needed
/// its slot fails instead and leaves the cache as it was.
#[tokio::test]
async fn test_dirty_entry_survives_failed_eviction() {
    let (store, _, engine) = memory_engine(1, WritePolicy::WriteBack);
    let a = create_chat(&engine, &[1], ChatConfig::default()).await;
    let b = create_chat(&engine, &[2], ChatConfig::default()).await;

    engine
        .send_message(a, UserId(1), b"unsaved", PASSWORD)
        .await
        .expect("send");
    assert!(engine.is_dirty(a).await);
    assert_eq!(store.message_count(a), 0);

    store.set_appends_failing(true);
    let err = engine.get_or_load(b).await.expect_err("eviction blocked");
    assert!(err.is_retryable());
    assert!(engine.is_resident(a));
    assert!(engine.is_dirty(a).await);
    assert!(!engine.is_resident(b));
    assert_eq!(engine.resident_count(), 1);

    store.set_appends_failing(false);
    engine.get_or_load(b).await.expect("load b");
    assert!(!engine.is_resident(a));
    assert_eq!(store.message_count(a), 1);

    let page = engine
        .get_messages(a, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    assert_eq!(page[0].text(), Some("unsaved"));
}

/// A failed write-through append leaves no trace in the cache.
#[tokio::test]
async fn test_failed_write_through_is_not_cached() {
    let (store, _, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(&engine, &[1], ChatConfig::default()).await;
    engine.get_or_load(chat_id).await.expect("load");

    store.set_appends_failing(true);
    let err = engine
        .send_message(chat_id, UserId(1), b"lost", PASSWORD)
        .await
        .expect_err("append fails");
    assert!(matches!(err, Error::StorageUnavailable(_)));

    let info = engine.chat_info(chat_id).await.expect("info");
    assert_eq!(info.cached_messages, 0);
    assert_eq!(info.unflushed_messages, 0);
}

/// RSA-OAEP chats generate one key pair, persist it sealed, and reuse it.
#[tokio::test]
async fn test_rsa_chat_flow() {
    let (store, _, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(
        &engine,
        &[1, 2],
        ChatConfig {
            encryption_type: AlgorithmId::RsaOaep,
            ..Default::default()
        },
    )
    .await;

    engine
        .send_message(chat_id, UserId(1), b"uno", PASSWORD)
        .await
        .expect("send");
    let sealed = store
        .load_session(chat_id)
        .await
        .expect("session")
        .key_material
        .expect("key material persisted");

    engine
        .send_message(chat_id, UserId(2), b"dos", PASSWORD)
        .await
        .expect("send");
    let again = store
        .load_session(chat_id)
        .await
        .expect("session")
        .key_material
        .expect("key material persisted");
    assert_eq!(sealed, again);

    let page = engine
        .get_messages(chat_id, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    let texts: Vec<_> = page.iter().filter_map(|m| m.text()).collect();
    assert_eq!(texts, vec!["uno", "dos"]);

    let wrong = engine
        .get_messages(chat_id, "wrong", MessageRange::default())
        .await
        .expect("read");
    assert!(wrong
        .iter()
        .all(|m| matches!(m.plaintext, Err(Error::DecryptionFailed))));

    let too_long = vec![b'x'; 512];
    assert!(matches!(
        engine.send_message(chat_id, UserId(1), &too_long, PASSWORD).await,
        Err(Error::PayloadTooLarge)
    ));
}

/// Two engines sharing a signing secret exchange messages through the
/// transport bridge; replays are recognized.
#[tokio::test]
async fn test_transport_bridge_between_engines() {
    let (_, _, alice) = memory_engine(4, WritePolicy::WriteThrough);
    let (_, _, bob) = memory_engine(4, WritePolicy::WriteThrough);
    let alice_chat = create_chat(&alice, &[1, 2], ChatConfig::default()).await;
    let bob_chat = create_chat(&bob, &[1, 2], ChatConfig::default()).await;
    assert_eq!(alice_chat, bob_chat);

    let sent = alice
        .send_message(alice_chat, UserId(1), b"hola bob", PASSWORD)
        .await
        .expect("send");
    let wire = alice.outbound_envelope(&sent).expect("sign").to_bytes();

    match bob.accept_envelope(&wire).await.expect("accept") {
        Accepted::Stored(record) => assert_eq!(record.message_id, sent.message_id),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        bob.accept_envelope(&wire).await.expect("accept"),
        Accepted::Duplicate(_)
    ));

    let page = bob
        .get_messages(bob_chat, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].text(), Some("hola bob"));

    let mut forged = wire.clone();
    let last = forged.len() - 1;
    forged[last] ^= 0xff;
    assert!(matches!(
        bob.accept_envelope(&forged).await,
        Err(Error::MalformedEnvelope)
    ));
}

/// The engine over SQLite persists across restarts.
#[tokio::test]
async fn test_sqlite_backed_engine_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sqlite = SqliteConfig {
        path: dir.path().join("chat.db").to_string_lossy().into_owned(),
        in_memory: false,
    };

    let chat_id = {
        let store = Arc::new(SqliteStore::open(&sqlite).expect("open"));
        let engine = ChatEngine::new(store, engine_config(4, WritePolicy::WriteBack));
        let chat_id = create_chat(
            &engine,
            &[1, 2],
            ChatConfig {
                encryption_type: AlgorithmId::ChaCha20Poly1305,
                ..Default::default()
            },
        )
        .await;
        engine
            .send_message(chat_id, UserId(1), b"persisted", PASSWORD)
            .await
            .expect("send");
        assert_eq!(engine.shutdown().await.expect("shutdown"), 1);
        chat_id
    };

    let store = Arc::new(SqliteStore::open(&sqlite).expect("reopen"));
    let engine = ChatEngine::new(store, engine_config(4, WritePolicy::WriteBack));
    let session = engine.get_or_load(chat_id).await.expect("load");
    assert_eq!(session.encryption_type, AlgorithmId::ChaCha20Poly1305);

    let page = engine
        .get_messages(chat_id, PASSWORD, MessageRange::default())
        .await
        .expect("read");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].text(), Some("persisted"));
    assert_eq!(page[0].record.seq, 0);

    let next = engine
        .send_message(chat_id, UserId(2), b"again", PASSWORD)
        .await
        .expect("send");
    assert_eq!(next.seq, 1);
}

/// An inbound message follows the receiving chat's auto-delete window, not
/// the sender's.
#[tokio::test]
async fn test_inbound_message_uses_receiver_ttl() {
    let (_, _, alice) = memory_engine(4, WritePolicy::WriteThrough);
    let (bob_store, bob_clock, bob) = memory_engine(4, WritePolicy::WriteThrough);
    let alice_chat = create_chat(&alice, &[1, 2], ChatConfig::default()).await;
    let bob_chat = create_chat(
        &bob,
        &[1, 2],
        ChatConfig {
            auto_delete_hours: 1,
            ..Default::default()
        },
    )
    .await;

    let sent = alice
        .send_message(alice_chat, UserId(1), b"hola bob", PASSWORD)
        .await
        .expect("send");
    assert_eq!(sent.delete_at, None);
    let wire = alice.outbound_envelope(&sent).expect("sign").to_bytes();

    let stored = match bob.accept_envelope(&wire).await.expect("accept") {
        Accepted::Stored(record) => record,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(
        stored.delete_at,
        Some(stored.created_at + chrono::Duration::hours(1))
    );

    bob_clock.advance(chrono::Duration::days(3650));
    assert!(bob
        .get_messages(bob_chat, PASSWORD, MessageRange::default())
        .await
        .expect("read")
        .is_empty());
    assert_eq!(bob.cleanup_expired_messages().await.expect("cleanup"), 1);
    assert_eq!(bob_store.message_count(bob_chat), 0);
}

/// Cancelling the task that is loading a chat neither wedges concurrent
/// callers nor later ones.
#[tokio::test(start_paused = true)]
async fn test_cancelled_load_is_retried() {
    let (store, _, engine) = memory_engine(4, WritePolicy::WriteThrough);
    let chat_id = create_chat(&engine, &[1, 2], ChatConfig::default()).await;
    store.set_load_delay(Some(Duration::from_millis(100)));

    let loader = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.get_or_load(chat_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waiter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.get_or_load(chat_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    loader.abort();
    assert!(loader.await.expect_err("aborted").is_cancelled());
    assert!(!engine.is_resident(chat_id));

    let session = waiter.await.expect("join").expect("load");
    assert_eq!(session.chat_id, chat_id);
    assert!(engine.is_resident(chat_id));
    assert_eq!(store.session_loads(), 1);

    store.set_load_delay(None);
    engine.evict(chat_id).await.expect("evict");
    engine.get_or_load(chat_id).await.expect("reload");
    assert_eq!(store.session_loads(), 2);
}

/// A flush dropped mid-append leaves the chat dirty, and the next flush
/// persists everything exactly once.
#[tokio::test(start_paused = true)]
async fn test_cancelled_flush_keeps_entry_dirty() {
    let (store, _, engine) = memory_engine(4, WritePolicy::WriteBack);
    let chat_id = create_chat(&engine, &[1, 2], ChatConfig::default()).await;
    for text in ["uno", "dos"] {
        engine
            .send_message(chat_id, UserId(1), text.as_bytes(), PASSWORD)
            .await
            .expect("send");
    }

    store.set_append_delay(Some(Duration::from_millis(100)));
    let cancelled = tokio::time::timeout(Duration::from_millis(10), engine.flush(chat_id)).await;
    assert!(cancelled.is_err());
    assert!(engine.is_dirty(chat_id).await);
    assert_eq!(store.appends(), 0);

    store.set_append_delay(None);
    assert_eq!(engine.flush(chat_id).await.expect("flush"), 2);
    assert!(!engine.is_dirty(chat_id).await);
    assert_eq!(store.message_count(chat_id), 2);
    assert_eq!(engine.flush(chat_id).await.expect("flush"), 0);
}
