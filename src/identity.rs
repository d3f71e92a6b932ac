//! Server identity: the keypair requests in the Discovery and Acceptance
//! phases are addressed to, plus the server id clients ask for.
//!
//! The keypair is stored as JSON next to the config:
//!
//! ```json
//! { "server_id": "abc", "secret_key": "<hex scalar>" }
//! ```
//!
//! The file is written owner-only. If no server id is configured the
//! fingerprint of the public key is used.

use anyhow::{Context, Result};
use p256::elliptic_curve::rand_core::OsRng;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use zeroize::Zeroizing;

use crate::keys::{fingerprint, Hash};

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    server_id: String,
    secret_key: String,
}

/// Keypair and id of this notification server.
#[derive(Clone)]
pub struct ServerIdentity {
    secret: SecretKey,
    server_id: String,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("server_id", &self.server_id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    /// Wrap an existing key.
    pub fn new(secret: SecretKey, server_id: impl Into<String>) -> Self {
        Self {
            secret,
            server_id: server_id.into(),
        }
    }

    /// Fresh random keypair. Without an id, the fingerprint hex is used.
    pub fn generate(server_id: Option<String>) -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let server_id = server_id.unwrap_or_else(|| fingerprint(&secret.public_key()).to_hex());
        Self { secret, server_id }
    }

    /// Load the identity at `path`, or generate and save one.
    ///
    /// A configured `server_id` overrides the stored one (and is saved).
    pub fn load_or_create(path: &Path, server_id: Option<String>) -> Result<Self> {
        if path.exists() {
            let content = Zeroizing::new(
                fs::read_to_string(path)
                    .with_context(|| format!("Failed to read identity {}", path.display()))?,
            );
            let stored: StoredIdentity =
                serde_json::from_str(&content).context("Failed to parse identity file")?;
            let bytes = Zeroizing::new(
                hex::decode(stored.secret_key.trim_start_matches("0x"))
                    .context("Invalid identity key encoding")?,
            );
            let secret = SecretKey::from_slice(&bytes).context("Invalid identity key")?;

            let identity = match server_id {
                Some(id) if id != stored.server_id => {
                    log::info!("Server id changed from '{}' to '{}'", stored.server_id, id);
                    let identity = Self::new(secret, id);
                    identity.save(path)?;
                    identity
                }
                _ => Self::new(secret, stored.server_id),
            };
            log::info!(
                "Loaded server identity '{}' ({})",
                identity.server_id,
                identity.fingerprint().short()
            );
            Ok(identity)
        } else {
            let identity = Self::generate(server_id);
            identity.save(path)?;
            log::info!(
                "Created server identity '{}' ({}) at {}",
                identity.server_id,
                identity.fingerprint().short(),
                path.display()
            );
            Ok(identity)
        }
    }

    /// Write the identity to `path` with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create identity directory")?;
        }
        let stored = StoredIdentity {
            server_id: self.server_id.clone(),
            secret_key: hex::encode(self.secret.to_bytes()),
        };
        let content = Zeroizing::new(serde_json::to_string_pretty(&stored)?);
        fs::write(path, content.as_bytes())
            .with_context(|| format!("Failed to write identity {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Id clients must name in Discovery and Acceptance requests.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Secret key, used to open asymmetric filters and sign responses.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Public key clients address requests to.
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> Hash {
        fingerprint(&self.public_key())
    }
}
