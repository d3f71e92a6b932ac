//! Passphrase encryption of session keys at rest.
//!
//! Session keys are sealed in the same shape as an Ethereum v3 keystore
//! `crypto` section, so the record can be inspected with existing tooling:
//!
//! ```json
//! {
//!   "cipher": "aes-128-ctr",
//!   "ciphertext": "<hex>",
//!   "cipherparams": { "iv": "<hex>" },
//!   "kdf": "scrypt",
//!   "kdfparams": { "n": 262144, "r": 8, "p": 1, "dklen": 32, "salt": "<hex>" },
//!   "mac": "<hex>"
//! }
//! ```
//!
//! The 32-byte KDF output is split into an AES-128 key (first half) and a MAC
//! key (second half). `mac = keccak256(mac_key || ciphertext)` is verified
//! before anything is decrypted; a mismatch is always [`CryptoError::Decrypt`].
//!
//! Reading also accepts `kdf = "pbkdf2"` with `prf = "hmac-sha256"`.

use aes::cipher::{KeyIvInit, StreamCipher};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::keccak256;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Only supported cipher.
pub const CIPHER_AES_128_CTR: &str = "aes-128-ctr";
/// Default KDF for new records.
pub const KDF_SCRYPT: &str = "scrypt";
/// Alternate KDF accepted on read.
pub const KDF_PBKDF2: &str = "pbkdf2";

const PBKDF2_PRF: &str = "hmac-sha256";
const DERIVED_KEY_LENGTH: usize = 32;
const SALT_LENGTH: usize = 32;
const IV_LENGTH: usize = 16;

/// Errors from sealing or opening a key record.
///
/// Every failure is terminal: no partially decrypted data is ever returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// MAC mismatch: wrong passphrase or tampered record.
    #[error("could not decrypt key with given passphrase")]
    Decrypt,
    /// Record uses a cipher other than AES-128-CTR.
    #[error("cipher not supported: {0}")]
    UnsupportedCipher(String),
    /// Record uses an unknown KDF (or PRF for PBKDF2).
    #[error("kdf not supported: {0}")]
    UnsupportedKdf(String),
    /// Record is structurally invalid (bad hex, lengths or parameters).
    #[error("invalid key record: {0}")]
    InvalidRecord(String),
}

/// KDF cost profile used when sealing new records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfProfile {
    /// scrypt N=2^18, r=8, p=1.
    #[default]
    Standard,
    /// scrypt N=2^12, r=8, p=6, for constrained devices.
    Light,
}

impl KdfProfile {
    /// `(log2 N, r, p)` of this profile.
    pub fn scrypt_cost(self) -> (u8, u32, u32) {
        match self {
            Self::Standard => (18, 8, 1),
            Self::Light => (12, 8, 6),
        }
    }
}

/// AES-CTR parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    /// Hex-encoded 16-byte IV.
    pub iv: String,
}

/// The sealed form of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Cipher name; must be `aes-128-ctr`.
    pub cipher: String,
    /// Hex-encoded ciphertext.
    pub ciphertext: String,
    /// Cipher parameters.
    pub cipherparams: CipherParams,
    /// KDF name: `scrypt` or `pbkdf2`.
    pub kdf: String,
    /// KDF parameters; shape depends on `kdf`.
    pub kdfparams: serde_json::Value,
    /// Hex-encoded Keccak-256 MAC.
    pub mac: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScryptParams {
    n: u64,
    r: u32,
    p: u32,
    dklen: usize,
    salt: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pbkdf2Params {
    c: u32,
    dklen: usize,
    prf: String,
    salt: String,
}

/// Seal `plaintext` under `passphrase` with a fresh salt and IV.
pub fn encrypt_key(
    plaintext: &[u8],
    passphrase: &str,
    profile: KdfProfile,
) -> Result<KeyRecord, CryptoError> {
    let mut salt = [0u8; SALT_LENGTH];
    rand::rng().fill_bytes(&mut salt);

    let (log_n, r, p) = profile.scrypt_cost();
    let derived = scrypt_key(passphrase, &salt, log_n, r, p)?;
    let kdfparams = ScryptParams {
        n: 1u64 << log_n,
        r,
        p,
        dklen: DERIVED_KEY_LENGTH,
        salt: hex::encode(salt),
    };
    seal(plaintext, &derived, KDF_SCRYPT, to_value(&kdfparams)?)
}

/// Open a record sealed by [`encrypt_key`] (or a compatible keystore).
///
/// The MAC is checked before decryption.
pub fn decrypt_key(record: &KeyRecord, passphrase: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if record.cipher != CIPHER_AES_128_CTR {
        return Err(CryptoError::UnsupportedCipher(record.cipher.clone()));
    }

    let derived = match record.kdf.as_str() {
        KDF_SCRYPT => {
            let params: ScryptParams = from_value(&record.kdfparams)?;
            check_dklen(params.dklen)?;
            if !params.n.is_power_of_two() || params.n < 2 {
                return Err(invalid("scrypt n must be a power of two"));
            }
            let log_n = u8::try_from(params.n.trailing_zeros())
                .map_err(|e| invalid(&e.to_string()))?;
            scrypt_key(passphrase, &decode(&params.salt, "salt")?, log_n, params.r, params.p)?
        }
        KDF_PBKDF2 => {
            let params: Pbkdf2Params = from_value(&record.kdfparams)?;
            check_dklen(params.dklen)?;
            if params.prf != PBKDF2_PRF {
                return Err(CryptoError::UnsupportedKdf(format!("{KDF_PBKDF2}/{}", params.prf)));
            }
            pbkdf2_key(passphrase, &decode(&params.salt, "salt")?, params.c)
        }
        other => return Err(CryptoError::UnsupportedKdf(other.to_string())),
    };

    let ciphertext = decode(&record.ciphertext, "ciphertext")?;
    let mac = decode(&record.mac, "mac")?;
    let iv = decode(&record.cipherparams.iv, "iv")?;
    if iv.len() != IV_LENGTH {
        return Err(invalid("iv must be 16 bytes"));
    }

    let expected = compute_mac(&derived, &ciphertext);
    if !bool::from(expected.as_bytes().as_slice().ct_eq(&mac)) {
        return Err(CryptoError::Decrypt);
    }

    let mut plaintext = Zeroizing::new(ciphertext);
    apply_ctr(&derived, &iv, &mut plaintext)?;
    Ok(plaintext)
}

/// Encrypt under an already-derived key and assemble the record.
fn seal(
    plaintext: &[u8],
    derived: &[u8; DERIVED_KEY_LENGTH],
    kdf: &str,
    kdfparams: serde_json::Value,
) -> Result<KeyRecord, CryptoError> {
    let mut iv = [0u8; IV_LENGTH];
    rand::rng().fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    apply_ctr(derived, &iv, &mut ciphertext)?;
    let mac = compute_mac(derived, &ciphertext);

    Ok(KeyRecord {
        cipher: CIPHER_AES_128_CTR.to_string(),
        ciphertext: hex::encode(&ciphertext),
        cipherparams: CipherParams {
            iv: hex::encode(iv),
        },
        kdf: kdf.to_string(),
        kdfparams,
        mac: hex::encode(mac.as_bytes()),
    })
}

fn apply_ctr(derived: &[u8; DERIVED_KEY_LENGTH], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
    let mut cipher = Aes128Ctr::new_from_slices(&derived[..16], iv)
        .map_err(|e| invalid(&e.to_string()))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn compute_mac(derived: &[u8; DERIVED_KEY_LENGTH], ciphertext: &[u8]) -> crate::keys::Hash {
    let mut input = Vec::with_capacity(16 + ciphertext.len());
    input.extend_from_slice(&derived[16..32]);
    input.extend_from_slice(ciphertext);
    keccak256(&input)
}

fn scrypt_key(
    passphrase: &str,
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LENGTH]>, CryptoError> {
    let params = scrypt::Params::new(log_n, r, p, DERIVED_KEY_LENGTH)
        .map_err(|e| invalid(&e.to_string()))?;
    let mut derived = Zeroizing::new([0u8; DERIVED_KEY_LENGTH]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, derived.as_mut_slice())
        .map_err(|e| invalid(&e.to_string()))?;
    Ok(derived)
}

fn pbkdf2_key(passphrase: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; DERIVED_KEY_LENGTH]> {
    let mut derived = Zeroizing::new([0u8; DERIVED_KEY_LENGTH]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, derived.as_mut_slice());
    derived
}

fn check_dklen(dklen: usize) -> Result<(), CryptoError> {
    if dklen == DERIVED_KEY_LENGTH {
        Ok(())
    } else {
        Err(invalid(&format!("dklen must be {DERIVED_KEY_LENGTH}, got {dklen}")))
    }
}

fn decode(field: &str, name: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(field.strip_prefix("0x").unwrap_or(field))
        .map_err(|e| invalid(&format!("{name}: {e}")))
}

fn to_value<T: Serialize>(params: &T) -> Result<serde_json::Value, CryptoError> {
    serde_json::to_value(params).map_err(|e| invalid(&e.to_string()))
}

fn from_value<T: for<'de> Deserialize<'de>>(value: &serde_json::Value) -> Result<T, CryptoError> {
    T::deserialize(value).map_err(|e| invalid(&format!("kdfparams: {e}")))
}

fn invalid(reason: &str) -> CryptoError {
    CryptoError::InvalidRecord(reason.to_string())
}

#[cfg(test)]
pub(crate) fn encrypt_key_pbkdf2(plaintext: &[u8], passphrase: &str, rounds: u32) -> KeyRecord {
    let salt = [7u8; SALT_LENGTH];
    let derived = pbkdf2_key(passphrase, &salt, rounds);
    let params = Pbkdf2Params {
        c: rounds,
        dklen: DERIVED_KEY_LENGTH,
        prf: PBKDF2_PRF.to_string(),
        salt: hex::encode(salt),
    };
    seal(plaintext, &derived, KDF_PBKDF2, to_value(&params).unwrap()).unwrap()
}
