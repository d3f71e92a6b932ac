//! Service error taxonomy.
//!
//! Protocol errors drop the offending message and are logged at `warn`.
//! Everything else is a resource or crypto failure surfaced to the caller.

use thiserror::Error;

use crate::keys::{Hash, KeyError};
use crate::notifier::NotifyError;
use crate::session::{SessionError, StoreError};
use crate::transport::TransportError;

/// Errors from the notification service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Request carried no sender public key.
    #[error("message sender is required")]
    MissingSender,
    /// No session holds the key the message was opened with.
    #[error("session {0:?} not found")]
    UnknownSession(Option<Hash>),
    /// Payload is not the JSON the phase expects.
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Request names another server.
    #[error("request for server '{requested}', this is '{expected}'")]
    WrongServer {
        /// Server id in the request.
        requested: String,
        /// This server's id.
        expected: String,
    },
    /// Device registration without a token.
    #[error("'device' cannot be empty")]
    EmptyDevice,
    /// `start` called twice.
    #[error("service already started")]
    AlreadyStarted,
    /// Session key generation failed.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Session store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Stored session could not be interpreted.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Notification fan-out failed or had no target.
    #[error(transparent)]
    Notify(#[from] NotifyError),
    /// Filter installation or send failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServiceError {
    /// Whether this is a bad request rather than a service failure.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::MissingSender
                | Self::UnknownSession(_)
                | Self::Malformed(_)
                | Self::WrongServer { .. }
                | Self::EmptyDevice
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        assert!(ServiceError::MissingSender.is_protocol());
        assert!(ServiceError::EmptyDevice.is_protocol());
        assert!(ServiceError::UnknownSession(None).is_protocol());
        assert!(!ServiceError::Key(KeyError::WeakKey).is_protocol());
        assert!(!ServiceError::Transport(TransportError::Rejected("ttl".into())).is_protocol());
    }
}
