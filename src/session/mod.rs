//! Session records and the per-chat device registry.
//!
//! A [`Session`] is the durable unit of shared secret: its key, the key's
//! lookup hash, and an open attribute map. The service works with two typed
//! views over it:
//!
//! - [`ClientSession`] - established on Acceptance, known only to the server
//!   and the one client that accepted it
//! - [`ChatSession`] - created from a client session; its key is a bearer
//!   capability shared with every participant of the chat
//!
//! A chat session's devices live in a [`DeviceRegistry`] behind their own
//! lock and are folded into the `devices` attribute when the session is
//! persisted.

pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::keys::{Hash, SessionKey};

pub use store::{SessionStore, StoreError};

/// Attribute holding a client session's owner fingerprint.
pub const ATTR_CLIENT: &str = "client";
/// Attribute holding the fingerprint of the client that created a chat.
pub const ATTR_PARENT: &str = "parent";
/// Attribute holding the optional application-level chat id.
pub const ATTR_CHAT: &str = "chat";
/// Attribute holding a chat session's device map.
pub const ATTR_DEVICES: &str = "devices";

/// Role of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Server <-> single client link.
    Client,
    /// Shareable chat link carrying device subscriptions.
    Chat,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Chat => f.write_str("chat"),
        }
    }
}

/// Errors converting a stored [`Session`] into a typed view.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Record holds a different kind of session.
    #[error("expected {expected} session, found {actual}")]
    WrongKind {
        /// Kind the caller asked for.
        expected: SessionKind,
        /// Kind found in the record.
        actual: SessionKind,
    },
    /// Attribute missing or malformed.
    #[error("attribute '{name}': {source}")]
    Attribute {
        /// Attribute name.
        name: &'static str,
        /// Parse failure.
        source: serde_json::Error,
    },
}

/// A persisted session.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Session role.
    pub kind: SessionKind,
    /// Symmetric session secret.
    pub key: SessionKey,
    /// Lookup hash of `key`; also the storage identifier.
    pub key_hash: Hash,
    /// Session-scoped state.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Session {
    /// New session with an empty attribute map.
    pub fn new(kind: SessionKind, key: SessionKey) -> Self {
        let key_hash = key.hash();
        Self {
            kind,
            key,
            key_hash,
            attributes: BTreeMap::new(),
        }
    }

    /// Storage identifier (the key hash).
    pub fn id(&self) -> Hash {
        self.key_hash
    }

    fn set_attribute<T: Serialize>(&mut self, name: &str, value: &T) {
        // Serializing hashes, strings and string maps cannot fail.
        if let Ok(value) = serde_json::to_value(value) {
            self.attributes.insert(name.to_string(), value);
        }
    }

    fn attribute<T: for<'de> Deserialize<'de>>(&self, name: &'static str) -> Result<T, SessionError> {
        let value = self
            .attributes
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|source| SessionError::Attribute { name, source })
    }

    fn expect_kind(&self, expected: SessionKind) -> Result<(), SessionError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(SessionError::WrongKind {
                expected,
                actual: self.kind,
            })
        }
    }
}

// ============================================================================
// Device registry
// ============================================================================

/// Map of requester fingerprint to device token for one chat session.
///
/// One token per fingerprint: registering again replaces the previous token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRegistry {
    devices: BTreeMap<Hash, String>,
}

impl DeviceRegistry {
    /// Add or replace the token of `fingerprint`. Returns the replaced token.
    pub fn register(&mut self, fingerprint: Hash, token: String) -> Option<String> {
        self.devices.insert(fingerprint, token)
    }

    /// Remove the token of `fingerprint`.
    pub fn remove(&mut self, fingerprint: &Hash) -> Option<String> {
        self.devices.remove(fingerprint)
    }

    /// Token registered for `fingerprint`.
    pub fn token(&self, fingerprint: &Hash) -> Option<&str> {
        self.devices.get(fingerprint).map(String::as_str)
    }

    /// Every token except the one registered by `requester`.
    pub fn targets_excluding(&self, requester: &Hash) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(fingerprint, _)| *fingerprint != requester)
            .map(|(_, token)| token.clone())
            .collect()
    }

    /// All registrations.
    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &str)> {
        self.devices.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ============================================================================
// Typed views
// ============================================================================

/// Session between the server and the one client that accepted it.
#[derive(Clone, Debug)]
pub struct ClientSession {
    /// Session secret.
    pub key: SessionKey,
    /// Fingerprint of the accepting client.
    pub client: Hash,
}

impl ClientSession {
    /// Lookup hash of the session key.
    pub fn key_hash(&self) -> Hash {
        self.key.hash()
    }

    /// Persistable record of this session.
    pub fn to_session(&self) -> Session {
        let mut session = Session::new(SessionKind::Client, self.key.clone());
        session.set_attribute(ATTR_CLIENT, &self.client);
        session
    }

    /// Rebuild from a stored record.
    pub fn from_session(session: &Session) -> Result<Self, SessionError> {
        session.expect_kind(SessionKind::Client)?;
        Ok(Self {
            key: session.key.clone(),
            client: session.attribute(ATTR_CLIENT)?,
        })
    }
}

/// Shareable chat session with its device subscriptions.
#[derive(Debug)]
pub struct ChatSession {
    /// Chat secret (bearer capability).
    pub key: SessionKey,
    /// Fingerprint of the client that created the chat.
    pub parent: Hash,
    /// Application-level chat id supplied at creation, if any.
    pub chat_id: Option<String>,
    /// Device subscriptions, independently locked.
    pub devices: RwLock<DeviceRegistry>,
}

impl ChatSession {
    /// New chat session with no devices.
    pub fn new(key: SessionKey, parent: Hash, chat_id: Option<String>) -> Self {
        Self {
            key,
            parent,
            chat_id,
            devices: RwLock::new(DeviceRegistry::default()),
        }
    }

    /// Lookup hash of the chat key.
    pub fn key_hash(&self) -> Hash {
        self.key.hash()
    }

    /// Persistable record of this session, including current devices.
    pub async fn to_session(&self) -> Session {
        let devices = self.devices.read().await;
        self.snapshot(&devices)
    }

    /// Persistable record with `devices`, for callers already holding the
    /// registry lock.
    pub fn snapshot(&self, devices: &DeviceRegistry) -> Session {
        let mut session = Session::new(SessionKind::Chat, self.key.clone());
        session.set_attribute(ATTR_PARENT, &self.parent);
        if let Some(chat_id) = &self.chat_id {
            session.set_attribute(ATTR_CHAT, chat_id);
        }
        session.set_attribute(ATTR_DEVICES, devices);
        session
    }

    /// Rebuild from a stored record. A missing device map means no devices.
    pub fn from_session(session: &Session) -> Result<Self, SessionError> {
        session.expect_kind(SessionKind::Chat)?;
        let devices: Option<DeviceRegistry> = session.attribute(ATTR_DEVICES)?;
        Ok(Self {
            key: session.key.clone(),
            parent: session.attribute(ATTR_PARENT)?,
            chat_id: session.attribute(ATTR_CHAT)?,
            devices: RwLock::new(devices.unwrap_or_default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{keccak256, new_session_key};

    #[test]
    fn test_register_same_fingerprint_keeps_latest_token() {
        let mut registry = DeviceRegistry::default();
        let alice = keccak256(b"alice");

        assert_eq!(registry.register(alice, "TOKEN_A".to_string()), None);
        assert_eq!(
            registry.register(alice, "TOKEN_B".to_string()),
            Some("TOKEN_A".to_string())
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.token(&alice), Some("TOKEN_B"));
    }

    #[test]
    fn test_targets_exclude_requester() {
        let mut registry = DeviceRegistry::default();
        let alice = keccak256(b"alice");
        let bob = keccak256(b"bob");
        registry.register(alice, "A".to_string());
        registry.register(bob, "B".to_string());

        assert_eq!(registry.targets_excluding(&alice), vec!["B".to_string()]);
        assert_eq!(registry.targets_excluding(&bob), vec!["A".to_string()]);
        assert_eq!(registry.targets_excluding(&keccak256(b"carol")).len(), 2);

        registry.remove(&bob);
        assert!(registry.targets_excluding(&alice).is_empty());
    }

    #[test]
    fn test_client_session_roundtrip() {
        let client = ClientSession {
            key: new_session_key().unwrap(),
            client: keccak256(b"client"),
        };
        let session = client.to_session();
        assert_eq!(session.kind, SessionKind::Client);
        assert_eq!(session.id(), client.key_hash());

        let back = ClientSession::from_session(&session).unwrap();
        assert_eq!(back.client, client.client);
        assert_eq!(back.key, client.key);
    }

    #[tokio::test]
    async fn test_chat_session_roundtrip_with_devices() {
        let chat = ChatSession::new(
            new_session_key().unwrap(),
            keccak256(b"parent"),
            Some("chat-1".to_string()),
        );
        chat.devices
            .write()
            .await
            .register(keccak256(b"bob"), "TOKEN_B".to_string());

        let session = chat.to_session().await;
        assert!(session.attributes.contains_key(ATTR_DEVICES));

        let back = ChatSession::from_session(&session).unwrap();
        assert_eq!(back.parent, chat.parent);
        assert_eq!(back.chat_id.as_deref(), Some("chat-1"));
        assert_eq!(back.devices.read().await.token(&keccak256(b"bob")), Some("TOKEN_B"));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let session = Session::new(SessionKind::Client, new_session_key().unwrap());
        assert!(matches!(
            ChatSession::from_session(&session),
            Err(SessionError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_chat_without_devices_attribute_is_empty() {
        let mut session = Session::new(SessionKind::Chat, new_session_key().unwrap());
        session.set_attribute(ATTR_PARENT, &keccak256(b"parent"));
        let chat = ChatSession::from_session(&session).unwrap();
        assert!(chat.devices.try_read().unwrap().is_empty());
        assert!(chat.chat_id.is_none());
    }
}
