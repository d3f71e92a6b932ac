//! Gossip transport abstraction.
//!
//! The service never talks to the network directly. It installs filters
//! (topic set + decryption key), polls each filter for messages the
//! transport has already matched and decrypted, and hands outgoing
//! envelopes back to the transport for sealing and proof-of-work.
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── MemoryTransport   in-process loopback (tests, local runs)
//!     │
//!     └── <node binding>    provided by the embedding application
//! ```
//!
//! Routing contract every implementation follows:
//! - an envelope with `dst` is delivered only to asymmetric filters whose
//!   public key equals `dst`
//! - otherwise an envelope with `key_sym` is delivered to symmetric filters
//!   holding the same key, and the message reports that key's hash
//! - in both cases the envelope topic must be one of the filter's topics
//!
//! Rust guideline compliant 2026-02

pub mod memory;

use async_trait::async_trait;
use p256::{PublicKey, SecretKey};
use thiserror::Error;

use crate::keys::{Hash, SessionKey};
use crate::topic::TopicId;

pub use memory::MemoryTransport;

/// Identifier of an installed filter.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FilterId(pub String);

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => write!(f, "{}...", &self.0[..end]),
            None => f.write_str(&self.0),
        }
    }
}

impl From<String> for FilterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Key a filter decrypts with.
#[derive(Clone)]
pub enum FilterKey {
    /// Shared session key.
    Symmetric(SessionKey),
    /// Recipient private key.
    Asymmetric(SecretKey),
}

impl std::fmt::Debug for FilterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symmetric(key) => f.debug_tuple("Symmetric").field(&key.hash()).finish(),
            Self::Asymmetric(_) => f.write_str("Asymmetric(..)"),
        }
    }
}

/// Subscription: messages on any of `topics` that `key` can open.
#[derive(Clone, Debug)]
pub struct Filter {
    /// Decryption key.
    pub key: FilterKey,
    /// Topics to match.
    pub topics: Vec<TopicId>,
}

impl Filter {
    /// Filter opening messages sealed with a session key.
    pub fn symmetric(key: SessionKey, topics: Vec<TopicId>) -> Self {
        Self {
            key: FilterKey::Symmetric(key),
            topics,
        }
    }

    /// Filter opening messages addressed to `secret`'s public key.
    pub fn asymmetric(secret: SecretKey, topics: Vec<TopicId>) -> Self {
        Self {
            key: FilterKey::Asymmetric(secret),
            topics,
        }
    }

    /// Whether the filter listens on `topic`.
    pub fn matches_topic(&self, topic: &TopicId) -> bool {
        self.topics.contains(topic)
    }
}

/// Outgoing message before sealing.
#[derive(Clone)]
pub struct Envelope {
    /// Routing topic.
    pub topic: TopicId,
    /// Plaintext payload.
    pub payload: Vec<u8>,
    /// Signing key; recipients see its public key as the sender.
    pub src: Option<SecretKey>,
    /// Recipient public key. Takes precedence over `key_sym`.
    pub dst: Option<PublicKey>,
    /// Symmetric key, used when `dst` is absent.
    pub key_sym: Option<SessionKey>,
    /// Time to live in seconds.
    pub ttl: u32,
    /// Proof-of-work target.
    pub pow: f64,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("signed", &self.src.is_some())
            .field("dst", &self.dst.as_ref().map(crate::keys::fingerprint))
            .field("key_sym", &self.key_sym)
            .field("ttl", &self.ttl)
            .field("pow", &self.pow)
            .finish()
    }
}

/// A matched and decrypted message.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// Topic it arrived on.
    pub topic: TopicId,
    /// Decrypted payload.
    pub payload: Vec<u8>,
    /// Sender public key, if the envelope was signed.
    pub src: Option<PublicKey>,
    /// Recipient public key, for asymmetric messages.
    pub dst: Option<PublicKey>,
    /// Hash of the symmetric key that opened it.
    pub sym_key_hash: Option<Hash>,
}

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Filter id is not installed.
    #[error("unknown filter: {0}")]
    UnknownFilter(FilterId),
    /// Envelope refused (ttl, proof of work, missing key).
    #[error("envelope rejected: {0}")]
    Rejected(String),
    /// Underlying node failure.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Topic-routed encrypted pub/sub transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install a filter.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Unavailable` if the node refuses the filter.
    async fn watch(&self, filter: Filter) -> Result<FilterId, TransportError>;

    /// Remove a filter; its undelivered messages are dropped.
    async fn unwatch(&self, id: &FilterId) -> Result<(), TransportError>;

    /// Drain messages matched by a filter since the last call.
    ///
    /// Must not block on network I/O.
    async fn retrieve(&self, id: &FilterId) -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Seal and post an envelope.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_id_display_truncates_by_character() {
        assert_eq!(FilterId::from("abcdef".to_string()).to_string(), "abcdef");
        assert_eq!(FilterId::from("0123456789ab".to_string()).to_string(), "01234567...");
        assert_eq!(FilterId::from("fïltér-ïdéntïty".to_string()).to_string(), "fïltér-ï...");
        assert_eq!(FilterId::from("ïïïïïïïï".to_string()).to_string(), "ïïïïïïïï");
    }
}
