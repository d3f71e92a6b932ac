//! Handshake Integration Tests
//!
//! Drives a running service through the in-memory transport the way real
//! clients would:
//! - Discover / Accept / NewChat / RegisterDevice / SendNotification
//! - Fan-out excludes the requester
//! - Chat sessions survive a restart through the encrypted store

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use p256::elliptic_curve::rand_core::OsRng;
use p256::SecretKey;
use serde_json::{json, Value};
use tempfile::TempDir;

use whisper_notify::crypto::KdfProfile;
use whisper_notify::keys::fingerprint;
use whisper_notify::notifier::MemoryProvider;
use whisper_notify::transport::{Envelope, Filter};
use whisper_notify::{
    Config, MemoryTransport, NotificationProvider, NotificationService, Notifier, NotifyError,
    Phase, ServerIdentity, ServiceError, SessionKey, SessionPersistence, SessionStore, Transport,
};

const WAIT: Duration = Duration::from_secs(5);

/// A client party with its own keypair.
struct Party {
    secret: SecretKey,
    transport: Arc<MemoryTransport>,
}

impl Party {
    fn new(transport: &Arc<MemoryTransport>) -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
            transport: Arc::clone(transport),
        }
    }

    /// Send a request and wait for the reply addressed to this party.
    async fn request(
        &self,
        phase: Phase,
        to_server: Option<&ServerIdentity>,
        key: Option<&SessionKey>,
        body: Value,
    ) -> Value {
        let filter = self
            .transport
            .watch(Filter::asymmetric(self.secret.clone(), vec![phase.topic()]))
            .await
            .unwrap();
        self.send(phase, to_server, key, body).await;

        let reply = tokio::time::timeout(WAIT, async {
            loop {
                let mut messages = self.transport.retrieve(&filter).await.unwrap();
                if let Some(message) = messages.pop() {
                    return message;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no reply from server");
        self.transport.unwatch(&filter).await.unwrap();

        assert!(reply.src.is_some(), "replies are signed");
        serde_json::from_slice(&reply.payload).unwrap()
    }

    /// Send a request without waiting for anything.
    async fn send(
        &self,
        phase: Phase,
        to_server: Option<&ServerIdentity>,
        key: Option<&SessionKey>,
        body: Value,
    ) {
        self.transport
            .send(Envelope {
                topic: phase.topic(),
                payload: serde_json::to_vec(&body).unwrap(),
                src: Some(self.secret.clone()),
                dst: to_server.map(ServerIdentity::public_key),
                key_sym: key.cloned(),
                ttl: 60,
                pow: 0.01,
            })
            .await
            .unwrap();
    }
}

struct Harness {
    service: Arc<NotificationService>,
    identity: ServerIdentity,
    transport: Arc<MemoryTransport>,
    provider: Arc<MemoryProvider>,
}

fn harness(identity: ServerIdentity, persistence: Option<SessionPersistence>) -> Harness {
    let transport = Arc::new(MemoryTransport::default());
    let provider = MemoryProvider::new();
    let mut config = Config::default();
    config.poll_interval_ms = 10;

    let service = NotificationService::new(
        config,
        identity.clone(),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Notifier::new(Arc::clone(&provider) as Arc<dyn NotificationProvider>),
        persistence,
    );
    Harness {
        service,
        identity,
        transport,
        provider,
    }
}

fn key_from(reply: &Value) -> SessionKey {
    let hex = reply["key"].as_str().expect("reply carries a key");
    assert!(hex.starts_with("0x"));
    SessionKey::from_hex(hex).unwrap()
}

async fn wait_for_notifications(provider: &MemoryProvider, count: usize) {
    tokio::time::timeout(WAIT, async {
        while provider.sent().await.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("provider was not called");
}

/// Complete handshake from discovery to notification fan-out.
#[tokio::test]
async fn test_full_handshake_and_fan_out() {
    let h = harness(ServerIdentity::generate(Some("abc".to_string())), None);
    h.service.start().await.unwrap();

    let client = Party::new(&h.transport);
    let member = Party::new(&h.transport);
    let outsider = Party::new(&h.transport);

    // Discovery
    let reply = client
        .request(Phase::Discover, Some(&h.identity), None, json!({}))
        .await;
    assert_eq!(reply, json!({"server": "abc"}));

    // Acceptance
    let reply = client
        .request(Phase::Accept, Some(&h.identity), None, json!({"server": "abc"}))
        .await;
    let client_key = key_from(&reply);
    assert_eq!(client_key.as_bytes().len(), 32);
    assert_eq!(h.service.client_session_count().await, 1);

    // New chat over the client session
    let reply = client
        .request(Phase::NewChat, None, Some(&client_key), json!({}))
        .await;
    assert_eq!(reply["server"], "abc");
    let chat_key = key_from(&reply);
    assert_ne!(chat_key, client_key);

    let chat = h.service.chat_session(&chat_key.hash()).await.unwrap();
    assert!(chat.devices.read().await.is_empty());
    assert_eq!(chat.parent, fingerprint(&client.secret.public_key()));

    // Second party registers a device with the shared chat key
    let reply = member
        .request(
            Phase::RegisterDevice,
            None,
            Some(&chat_key),
            json!({"device": "TOKEN_A"}),
        )
        .await;
    assert_eq!(reply, json!({"server": "abc"}));
    {
        let devices = chat.devices.read().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(
            devices.token(&fingerprint(&member.secret.public_key())),
            Some("TOKEN_A")
        );
    }

    // Third party triggers a notification
    outsider
        .send(
            Phase::SendNotification,
            None,
            Some(&chat_key),
            json!({"msg": "ping"}),
        )
        .await;
    wait_for_notifications(&h.provider, 1).await;
    let sent = h.provider.sent().await;
    assert_eq!(sent[0].tokens, vec!["TOKEN_A".to_string()]);
    assert_eq!(sent[0].payload, json!({"msg": "ping"}));

    // The registered party notifying itself reaches nobody
    member
        .send(Phase::SendNotification, None, Some(&chat_key), json!({}))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.provider.sent().await.len(), 1);

    let result = h
        .service
        .notify(
            &chat_key.hash(),
            &fingerprint(&member.secret.public_key()),
            &json!({}),
        )
        .await;
    assert!(matches!(
        result,
        Err(ServiceError::Notify(NotifyError::NoTarget))
    ));

    h.service.stop().await;
    assert_eq!(h.transport.filter_count().await, 0);
}

/// Re-registering from the same key replaces the token instead of adding one.
#[tokio::test]
async fn test_reregistration_keeps_latest_token() {
    let h = harness(ServerIdentity::generate(Some("abc".to_string())), None);
    h.service.start().await.unwrap();

    let member = Party::new(&h.transport);
    let chat_key = h
        .service
        .register_chat_session(fingerprint(&member.secret.public_key()), None)
        .await
        .unwrap();

    for token in ["OLD", "NEW"] {
        member
            .request(
                Phase::RegisterDevice,
                None,
                Some(&chat_key),
                json!({"device": token}),
            )
            .await;
    }

    let chat = h.service.chat_session(&chat_key.hash()).await.unwrap();
    let devices = chat.devices.read().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(
        devices.token(&fingerprint(&member.secret.public_key())),
        Some("NEW")
    );
    drop(devices);

    h.service.stop().await;
}

/// Requests for another server id get no reply and create nothing.
#[tokio::test]
async fn test_accept_for_other_server_is_ignored() {
    let h = harness(ServerIdentity::generate(Some("abc".to_string())), None);
    h.service.start().await.unwrap();

    let client = Party::new(&h.transport);
    let filter = h
        .transport
        .watch(Filter::asymmetric(
            client.secret.clone(),
            vec![Phase::Accept.topic()],
        ))
        .await
        .unwrap();
    client
        .send(Phase::Accept, Some(&h.identity), None, json!({"server": "xyz"}))
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.transport.retrieve(&filter).await.unwrap().is_empty());
    assert_eq!(h.service.client_session_count().await, 0);

    h.service.stop().await;
}

/// Chat sessions and their devices are restored after a restart.
#[tokio::test]
async fn test_chat_session_restored_after_restart() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::open(dir.path().join("sessions"), KdfProfile::Light).unwrap();
    let identity = ServerIdentity::generate(Some("abc".to_string()));

    let (chat_key, member_fingerprint) = {
        let h = harness(
            identity.clone(),
            Some(SessionPersistence::new(store.clone(), "pw")),
        );
        h.service.start().await.unwrap();

        let client = Party::new(&h.transport);
        let member = Party::new(&h.transport);
        let reply = client
            .request(Phase::Accept, Some(&h.identity), None, json!({"server": "abc"}))
            .await;
        let client_key = key_from(&reply);
        let reply = client
            .request(Phase::NewChat, None, Some(&client_key), json!({"chat": "room"}))
            .await;
        let chat_key = key_from(&reply);
        member
            .request(
                Phase::RegisterDevice,
                None,
                Some(&chat_key),
                json!({"device": "TOKEN_A"}),
            )
            .await;

        h.service.stop().await;
        (chat_key, fingerprint(&member.secret.public_key()))
    };

    // Only the chat session is on disk; an unreadable record is skipped.
    assert_eq!(store.list().unwrap(), vec![chat_key.hash()]);
    let junk = "ab".repeat(32);
    std::fs::write(store.dir().join(format!("{junk}.json")), "not a session").unwrap();

    let h = harness(identity, Some(SessionPersistence::new(store.clone(), "pw")));
    h.service.start().await.unwrap();
    assert_eq!(h.service.client_session_count().await, 0);
    assert_eq!(h.service.chat_session_ids().await, vec![chat_key.hash()]);

    let chat = h.service.chat_session(&chat_key.hash()).await.unwrap();
    assert_eq!(chat.chat_id.as_deref(), Some("room"));
    assert_eq!(
        chat.devices.read().await.token(&member_fingerprint),
        Some("TOKEN_A")
    );

    let outsider = Party::new(&h.transport);
    outsider
        .send(Phase::SendNotification, None, Some(&chat_key), json!({}))
        .await;
    wait_for_notifications(&h.provider, 1).await;
    assert_eq!(h.provider.sent().await[0].tokens, vec!["TOKEN_A".to_string()]);

    h.service.stop().await;
}
