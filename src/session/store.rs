//! Encrypted on-disk session store.
//!
//! One JSON file per session, named by the hex key hash:
//!
//! ```text
//! <session_dir>/
//!     3f9c...e1.json     # { "type": "chat", "crypto": {...}, "values": {...} }
//! ```
//!
//! Only the session key is encrypted (see [`crate::crypto`]); `values`
//! carries the session attributes. Files are written to a temporary name
//! and renamed into place, with owner-only permissions.
//!
//! All operations are blocking file I/O plus an scrypt derivation; async
//! callers run them on the blocking pool.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Session, SessionKind};
use crate::crypto::{self, CryptoError, KdfProfile, KeyRecord};
use crate::keys::{Hash, SessionKey};

const FILE_EXTENSION: &str = "json";

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No file exists for the session id.
    #[error("session {0} not found")]
    NotFound(Hash),
    /// Decrypted key does not hash to the id it was stored under.
    #[error("stored key does not match session id {0}")]
    Mismatch(Hash),
    /// Key record failed to decrypt or is unsupported.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Filesystem failure.
    #[error("session store I/O: {0}")]
    Io(#[from] io::Error),
    /// File contents are not a session record.
    #[error("malformed session file: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk layout of one session.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    #[serde(rename = "type")]
    kind: SessionKind,
    crypto: KeyRecord,
    #[serde(default)]
    values: BTreeMap<String, serde_json::Value>,
}

/// Directory of passphrase-encrypted session files.
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
    kdf: KdfProfile,
}

impl SessionStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, kdf: KdfProfile) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { dir, kdf })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path of a session id.
    pub fn path_for(&self, id: &Hash) -> PathBuf {
        self.dir.join(format!("{}.{FILE_EXTENSION}", id.to_hex()))
    }

    /// Whether a file exists for `id`.
    pub fn contains(&self, id: &Hash) -> bool {
        self.path_for(id).exists()
    }

    /// Load and decrypt a session.
    pub fn get(&self, id: &Hash, passphrase: &str) -> Result<Session, StoreError> {
        let path = self.path_for(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(*id)),
            Err(e) => return Err(e.into()),
        };
        let file: SessionFile = serde_json::from_str(&content)?;

        let plaintext = crypto::decrypt_key(&file.crypto, passphrase)?;
        let key = SessionKey::from_slice(&plaintext).map_err(|_err| StoreError::Mismatch(*id))?;
        if key.hash() != *id {
            return Err(StoreError::Mismatch(*id));
        }

        log::debug!("Loaded {} session {}", file.kind, id.short());
        Ok(Session {
            kind: file.kind,
            key_hash: *id,
            key,
            attributes: file.values,
        })
    }

    /// Encrypt and write a session under its key hash, replacing any previous file.
    pub fn put(&self, session: &Session, passphrase: &str) -> Result<(), StoreError> {
        let id = session.key.hash();
        let file = SessionFile {
            kind: session.kind,
            crypto: crypto::encrypt_key(session.key.as_bytes(), passphrase, self.kdf)?,
            values: session.attributes.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        // Unique temp name per write; concurrent puts of one id race only on the rename.
        let path = self.path_for(&id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(".").suffix(".tmp");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o600));
        }
        let mut tmp = builder.tempfile_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        log::debug!("Saved {} session {} to {:?}", session.kind, id.short(), path);
        Ok(())
    }

    /// Delete a session file. Returns whether a file was removed.
    pub fn delete(&self, id: &Hash) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                log::info!("Deleted stored session {}", id.short());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every stored session. Files not named by a key hash are ignored.
    pub fn list(&self) -> Result<Vec<Hash>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Hash>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
