//! Push notification fan-out.
//!
//! The service never talks to a push gateway itself. A chat's device
//! tokens (minus the requester's own) are handed to a
//! [`NotificationProvider`] in one call. Provider failures are returned to
//! the caller as [`NotifyError::Provider`] and never touch the registry.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Result of one provider call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Tokens the provider accepted.
    pub success: usize,
    /// Tokens the provider rejected.
    pub failure: usize,
}

/// Errors from a notification fan-out.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// No device other than the requester's is registered.
    #[error("no notification targets")]
    NoTarget,
    /// Provider call failed.
    #[error("notification provider failed: {0:#}")]
    Provider(anyhow::Error),
}

/// External push gateway (FCM, APNs, ...).
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Deliver `payload` to every token in one request.
    async fn send(
        &self,
        tokens: &[String],
        payload: &serde_json::Value,
    ) -> anyhow::Result<ProviderResponse>;
}

/// Fan-out front end over a provider.
#[derive(Clone)]
pub struct Notifier {
    provider: Arc<dyn NotificationProvider>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    /// Wrap a provider.
    pub fn new(provider: Arc<dyn NotificationProvider>) -> Self {
        Self { provider }
    }

    /// Send `payload` to `targets`.
    ///
    /// An empty target list never reaches the provider.
    pub async fn send(
        &self,
        targets: &[String],
        payload: &serde_json::Value,
    ) -> Result<ProviderResponse, NotifyError> {
        if targets.is_empty() {
            return Err(NotifyError::NoTarget);
        }
        log::debug!("Notifying {} device(s)", targets.len());
        self.provider
            .send(targets, payload)
            .await
            .map_err(NotifyError::Provider)
    }
}

// ============================================================================
// In-memory provider
// ============================================================================

/// One recorded provider call.
#[derive(Clone, Debug, PartialEq)]
pub struct SentNotification {
    /// Target tokens.
    pub tokens: Vec<String>,
    /// Payload as received.
    pub payload: serde_json::Value,
}

/// Provider that records calls instead of delivering them.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    sent: Mutex<Vec<SentNotification>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryProvider {
    /// Recording provider that succeeds.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent calls fail (after recording them).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Calls recorded so far.
    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationProvider for MemoryProvider {
    async fn send(
        &self,
        tokens: &[String],
        payload: &serde_json::Value,
    ) -> anyhow::Result<ProviderResponse> {
        self.sent.lock().await.push(SentNotification {
            tokens: tokens.to_vec(),
            payload: payload.clone(),
        });
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("gateway unavailable");
        }
        Ok(ProviderResponse {
            success: tokens.len(),
            failure: 0,
        })
    }
}
