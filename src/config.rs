//! Configuration loading and persistence.
//!
//! Reads `<config_dir>/config.json` and applies `WHISPER_NOTIFY_*`
//! environment overrides. The session store passphrase is never written to
//! disk; it only comes from `WHISPER_NOTIFY_PASSPHRASE`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::constants::{DEFAULT_MINIMUM_POW, DEFAULT_POLL_INTERVAL, DEFAULT_TTL};
use crate::crypto::KdfProfile;
use crate::service::SessionPersistence;
use crate::session::SessionStore;

const CONFIG_FILE: &str = "config.json";
const IDENTITY_FILE: &str = "identity.json";
const SESSIONS_DIR: &str = "sessions";

/// Environment variable holding the session store passphrase.
pub const PASSPHRASE_ENV: &str = "WHISPER_NOTIFY_PASSPHRASE";

/// Configuration for the notification server.
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Id clients must name; defaults to the identity fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Identity keypair file; defaults to `<config_dir>/identity.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<PathBuf>,
    /// Session directory; defaults to `<config_dir>/sessions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
    /// TTL in seconds of outgoing responses.
    pub ttl: u32,
    /// Proof-of-work target of outgoing responses.
    pub minimum_pow: f64,
    /// Filter polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Persist client sessions (otherwise they live only in memory).
    pub persist_client_sessions: bool,
    /// Persist chat sessions and their device registrations.
    pub persist_chat_sessions: bool,
    /// scrypt cost used when sealing session keys.
    pub kdf: KdfProfile,
    /// Store passphrase - NOT serialized to disk.
    #[serde(skip)]
    passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_id", &self.server_id)
            .field("identity_path", &self.identity_path)
            .field("session_dir", &self.session_dir)
            .field("ttl", &self.ttl)
            .field("minimum_pow", &self.minimum_pow)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("persist_client_sessions", &self.persist_client_sessions)
            .field("persist_chat_sessions", &self.persist_chat_sessions)
            .field("kdf", &self.kdf)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: None,
            identity_path: None,
            session_dir: None,
            ttl: DEFAULT_TTL,
            minimum_pow: DEFAULT_MINIMUM_POW,
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(50),
            persist_client_sessions: false,
            persist_chat_sessions: true,
            kdf: KdfProfile::Standard,
            passphrase: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `WHISPER_NOTIFY_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom_dir) = std::env::var("WHISPER_NOTIFY_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("whisper-notify")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir` (defaults if absent) and fills in
    /// directory-relative paths.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let mut config: Self = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config
            .identity_path
            .get_or_insert_with(|| dir.join(IDENTITY_FILE));
        config
            .session_dir
            .get_or_insert_with(|| dir.join(SESSIONS_DIR));
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `WHISPER_NOTIFY_*` overrides from `lookup`. Unparseable
    /// numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_id) = lookup("WHISPER_NOTIFY_SERVER_ID") {
            self.server_id = Some(server_id);
        }

        if let Some(session_dir) = lookup("WHISPER_NOTIFY_SESSION_DIR") {
            self.session_dir = Some(PathBuf::from(session_dir));
        }

        if let Some(ttl) = lookup("WHISPER_NOTIFY_TTL") {
            if let Ok(ttl) = ttl.parse::<u32>() {
                self.ttl = ttl;
            }
        }

        if let Some(interval) = lookup("WHISPER_NOTIFY_POLL_INTERVAL_MS") {
            if let Ok(interval) = interval.parse::<u64>() {
                self.poll_interval_ms = interval;
            }
        }

        if let Some(passphrase) = lookup(PASSPHRASE_ENV) {
            self.passphrase = Some(Zeroizing::new(passphrase));
        }
    }

    /// Persists the configuration to `dir`. The passphrase is NOT saved.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Identity file path.
    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(IDENTITY_FILE))
    }

    /// Session directory path.
    pub fn session_dir(&self) -> PathBuf {
        self.session_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(SESSIONS_DIR))
    }

    /// Polling interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Store passphrase, if configured.
    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_ref().map(|p| p.as_str())
    }

    /// Set the store passphrase.
    pub fn set_passphrase(&mut self, passphrase: impl Into<String>) {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
    }

    /// Whether any session type is persisted.
    pub fn persists_sessions(&self) -> bool {
        self.persist_client_sessions || self.persist_chat_sessions
    }

    /// Open the session store, if a passphrase is configured.
    pub fn session_persistence(&self) -> Result<Option<SessionPersistence>> {
        let Some(passphrase) = &self.passphrase else {
            if self.persists_sessions() {
                log::warn!("{} not set, sessions will not be persisted", PASSPHRASE_ENV);
            }
            return Ok(None);
        };
        let dir = self.session_dir();
        let store = SessionStore::open(&dir, self.kdf)
            .with_context(|| format!("Failed to open session store {}", dir.display()))?;
        Ok(Some(SessionPersistence::new(store, passphrase.as_str())))
    }
}
