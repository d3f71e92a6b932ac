//! Session key generation and hashing.
//!
//! Session keys are the symmetric secrets handed out during the handshake.
//! Each key is identified by its Keccak-256 hash: the transport reports the
//! same hash for every message it decrypts with that key, so the hash routes
//! an incoming message back to its session and also names the session file
//! on disk.
//!
//! Requester identities are reduced to a [`Hash`] of their public key
//! (a fingerprint) before they are stored anywhere.

// Rust guideline compliant 2026-02

use std::fmt;
use std::str::FromStr;

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{ENVELOPE_VERSION, HASH_LENGTH, KEY_LENGTH, ONE_TIME_KEY_ITERATIONS};

/// Errors produced while generating or parsing key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Random draw or derived key was all zeros.
    #[error("generated key material is all zeros")]
    WeakKey,
    /// One-time key derivation requested for an unknown envelope version.
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u64),
    /// Key bytes had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },
    /// Key or hash was not valid hex.
    #[error("invalid hex encoding")]
    InvalidHex,
}

// ============================================================================
// Hash
// ============================================================================

/// Keccak-256 digest, used both as a session key hash and as a public key
/// fingerprint.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_LENGTH]);

impl Hash {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Unprefixed hex form, used as the on-disk session identifier.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl FromStr for Hash {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        let actual = bytes.len();
        let digest: [u8; HASH_LENGTH] = bytes.try_into().map_err(|_bytes: Vec<u8>| {
            KeyError::InvalidLength {
                expected: HASH_LENGTH,
                actual,
            }
        })?;
        Ok(Self(digest))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}

/// Lookup hash of a session key.
///
/// Must match the hash the transport attaches to symmetric-key-decrypted
/// messages, otherwise incoming requests can't be routed to their session.
pub fn key_hash(key: &[u8]) -> Hash {
    keccak256(key)
}

/// Fingerprint of a requester public key (hash of the uncompressed SEC1 point).
pub fn fingerprint(public_key: &PublicKey) -> Hash {
    keccak256(public_key.to_encoded_point(false).as_bytes())
}

// ============================================================================
// Session keys
// ============================================================================

/// Symmetric session secret. Zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    /// Wrap raw key bytes, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_err| KeyError::InvalidLength {
            expected: KEY_LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Self(key))
    }

    /// Parse a hex key as sent on the wire (with or without `0x`).
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let mut bytes = decode_hex(s)?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `0x`-prefixed hex form used in handshake responses.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Lookup hash of this key.
    pub fn hash(&self) -> Hash {
        key_hash(&self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKey").field(&self.hash()).finish()
    }
}

/// Generate a fresh session key.
///
/// Draws 64 random bytes, splits them into key and salt, and runs the
/// transport's one-time key derivation over them. Both the raw draw and the
/// derived key are rejected if they are all zeros.
pub fn new_session_key() -> Result<SessionKey, KeyError> {
    let mut raw = [0u8; KEY_LENGTH * 2];
    rand::rng().fill_bytes(&mut raw);
    let key = session_key_from_draw(&raw);
    raw.zeroize();
    key
}

/// Session key from a 64-byte random draw (key half, then salt half).
fn session_key_from_draw(raw: &[u8; KEY_LENGTH * 2]) -> Result<SessionKey, KeyError> {
    if contains_only_zeros(raw) {
        return Err(KeyError::WeakKey);
    }
    let (key, salt) = raw.split_at(KEY_LENGTH);
    let derived = derive_one_time_key(key, salt, ENVELOPE_VERSION)?;
    if contains_only_zeros(derived.as_bytes()) {
        return Err(KeyError::WeakKey);
    }
    Ok(derived)
}

/// One-time key derivation for a given envelope version.
///
/// Version 0 is PBKDF2-HMAC-SHA256 with 8 iterations and a 32-byte output.
pub fn derive_one_time_key(key: &[u8], salt: &[u8], version: u64) -> Result<SessionKey, KeyError> {
    if version != 0 {
        return Err(KeyError::UnsupportedVersion(version));
    }
    let mut derived = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(key, salt, ONE_TIME_KEY_ITERATIONS, &mut derived);
    Ok(SessionKey(derived))
}

pub(crate) fn contains_only_zeros(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, KeyError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|_err| KeyError::InvalidHex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::elliptic_curve::rand_core::OsRng;
    use p256::SecretKey;
    use std::collections::HashSet;

    #[test]
    fn test_new_session_keys_are_unique() {
        let mut keys = HashSet::new();
        let mut hashes = HashSet::new();
        for _ in 0..64 {
            let key = new_session_key().unwrap();
            assert!(!contains_only_zeros(key.as_bytes()));
            keys.insert(key.as_bytes().to_vec());
            hashes.insert(key.hash());
        }
        assert_eq!(keys.len(), 64);
        assert_eq!(hashes.len(), 64);
    }

    #[test]
    fn test_all_zero_draw_is_weak() {
        assert_eq!(
            session_key_from_draw(&[0u8; KEY_LENGTH * 2]).unwrap_err(),
            KeyError::WeakKey
        );

        let mut draw = [0u8; KEY_LENGTH * 2];
        draw[KEY_LENGTH * 2 - 1] = 1;
        let key = session_key_from_draw(&draw).unwrap();
        assert_eq!(key, session_key_from_draw(&draw).unwrap());
        assert!(!contains_only_zeros(key.as_bytes()));
    }

    #[test]
    fn test_one_time_key_is_deterministic() {
        let a = derive_one_time_key(b"key", b"salt", 0).unwrap();
        let b = derive_one_time_key(b"key", b"salt", 0).unwrap();
        let c = derive_one_time_key(b"key", b"pepper", 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_one_time_key_rejects_unknown_version() {
        assert_eq!(
            derive_one_time_key(b"key", b"salt", 1).unwrap_err(),
            KeyError::UnsupportedVersion(1)
        );
    }

    #[test]
    fn test_key_hex_roundtrip_accepts_prefix() {
        let key = new_session_key().unwrap();
        let hex = key.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 2 + KEY_LENGTH * 2);
        assert_eq!(SessionKey::from_hex(&hex).unwrap(), key);
        assert_eq!(SessionKey::from_hex(&hex[2..]).unwrap(), key);
    }

    #[test]
    fn test_key_from_slice_checks_length() {
        assert_eq!(
            SessionKey::from_slice(&[1u8; 16]).unwrap_err(),
            KeyError::InvalidLength {
                expected: KEY_LENGTH,
                actual: 16
            }
        );
    }

    #[test]
    fn test_hash_parse_and_serde() {
        let hash = key_hash(b"some key");
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);

        assert_eq!("0xzz".parse::<Hash>().unwrap_err(), KeyError::InvalidHex);
    }

    #[test]
    fn test_fingerprint_distinguishes_keys() {
        let a = SecretKey::random(&mut OsRng).public_key();
        let b = SecretKey::random(&mut OsRng).public_key();
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = SessionKey::from_slice(&[0xab; KEY_LENGTH]).unwrap();
        assert!(!format!("{key:?}").contains(&hex::encode([0xab; KEY_LENGTH])));
    }
}
