//! whisper-notify - push notification handshake server over a topic-based
//! encrypted gossip transport.
//!
//! A client discovers a server, obtains a private client session, turns it
//! into a shareable chat session, and any holder of the chat key can then
//! register a device or trigger a push notification to everyone else in the
//! chat. Nobody learns anyone's network identity; requesters are known only
//! by the fingerprint of the key that signed their request.
//!
//! # Architecture
//!
//! - **Service** - owns the session tables, handles the five handshake phases
//! - **Dispatcher** - one polling task per transport filter, feeding a queue
//! - **Session store** - passphrase-encrypted session files on disk
//! - **Transport** - external gossip node behind a trait
//! - **Notifier** - external push provider behind a trait
//!
//! # Modules
//!
//! - [`topic`] - phase name to topic derivation
//! - [`keys`] - session keys, key hashes and fingerprints
//! - [`crypto`] - keystore-style encryption of keys at rest
//! - [`session`] - session records, device registry and the store
//! - [`service`] - the handshake server
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod constants;
pub mod crypto;
pub mod identity;
pub mod keys;
pub mod notifier;
pub mod service;
pub mod session;
pub mod topic;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use identity::ServerIdentity;
pub use keys::{Hash, SessionKey};
pub use notifier::{NotificationProvider, Notifier, NotifyError};
pub use service::{NotificationService, Phase, ServiceError, SessionPersistence};
pub use session::{ChatSession, ClientSession, DeviceRegistry, Session, SessionKind, SessionStore};
pub use transport::{MemoryTransport, Transport};
