//! Protocol-wide constants for whisper-notify.
//!
//! Phase names and the lengths below are a compatibility surface: clients
//! derive the same topics and keys from them, so changing any value here
//! requires a protocol version bump.
//!
//! # Categories
//!
//! - **Phases**: literal phase names fed into the topic deriver
//! - **Key material**: symmetric key, topic and hash sizes
//! - **Transport**: default envelope TTL, proof-of-work and polling cadence

use std::time::Duration;

// ============================================================================
// Phases
// ============================================================================

/// Discovery phase: a client asks which server answers on this network.
pub const PHASE_DISCOVER: &str = "/server/discover";

/// Acceptance phase: a client selects a server and receives a client session key.
pub const PHASE_ACCEPT: &str = "/server/accept";

/// New-chat phase: a client session asks for a shareable chat session key.
pub const PHASE_NEW_CHAT: &str = "/user/newchat";

/// Device registration phase: a chat key holder registers a device token.
pub const PHASE_REGISTER_DEVICE: &str = "/chat/register";

/// Notification phase: a chat key holder triggers a push fan-out.
pub const PHASE_SEND_NOTIFICATION: &str = "/chat/notification";

// ============================================================================
// Key material
// ============================================================================

/// Length of a session symmetric key (AES-256 key size used by the transport).
pub const KEY_LENGTH: usize = 32;

/// Length of a topic identifier on the transport.
pub const TOPIC_LENGTH: usize = 4;

/// Length of a Keccak-256 hash.
pub const HASH_LENGTH: usize = 32;

/// Envelope version understood by [`crate::keys::derive_one_time_key`].
pub const ENVELOPE_VERSION: u64 = 0;

/// PBKDF2 iterations used to stretch a phase name into topic material.
pub const TOPIC_KDF_ITERATIONS: u32 = 8192;

/// Bytes of PBKDF2 output folded into a topic identifier.
pub const TOPIC_KDF_OUTPUT: usize = 128;

/// PBKDF2 iterations of the one-time session key derivation.
pub const ONE_TIME_KEY_ITERATIONS: u32 = 8;

// ============================================================================
// Transport
// ============================================================================

/// Default time-to-live of outbound envelopes, in seconds.
pub const DEFAULT_TTL: u32 = 120;

/// Default proof-of-work target of outbound envelopes.
pub const DEFAULT_MINIMUM_POW: f64 = 0.001;

/// Default polling interval of a dispatch worker.
///
/// Each installed filter is drained on this tick; 50ms keeps handshake
/// latency well below the transport's own propagation delay.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Capacity of the queue between dispatch workers and the handler task.
pub const DISPATCH_QUEUE_CAPACITY: usize = 256;
