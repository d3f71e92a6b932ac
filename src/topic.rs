//! Topic derivation for protocol phases.
//!
//! A phase is addressed on the public transport by a short topic id rather
//! than by its name. The name is stretched with PBKDF2-HMAC-SHA512 (salted
//! with itself) and the output is folded into [`TOPIC_LENGTH`] bytes by XOR.

use std::fmt;

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;

use crate::constants::{TOPIC_KDF_ITERATIONS, TOPIC_KDF_OUTPUT, TOPIC_LENGTH};

/// Fixed-length topic identifier used by the transport for routing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId(pub [u8; TOPIC_LENGTH]);

impl TopicId {
    /// Raw topic bytes.
    pub fn as_bytes(&self) -> &[u8; TOPIC_LENGTH] {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Derive the topic id of a phase name.
///
/// Pure and deterministic: every node on the network computes the same id
/// for the same name.
pub fn derive_topic(phase_name: &str) -> TopicId {
    let name = phase_name.as_bytes();
    let mut stretched = [0u8; TOPIC_KDF_OUTPUT];
    pbkdf2_hmac::<Sha512>(name, name, TOPIC_KDF_ITERATIONS, &mut stretched);

    let mut topic = [0u8; TOPIC_LENGTH];
    for (i, byte) in stretched.iter().enumerate() {
        topic[i % TOPIC_LENGTH] ^= byte;
    }
    TopicId(topic)
}
