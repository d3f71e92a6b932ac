//! In-process loopback transport.
//!
//! Envelopes are routed synchronously into the queues of every matching
//! filter; nothing leaves the process. Sealing and proof-of-work are not
//! simulated, but the envelope is validated the way a node would.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::Mutex;

use super::{Envelope, Filter, FilterId, FilterKey, ReceivedMessage, Transport, TransportError};

#[derive(Debug)]
struct Installed {
    filter: Filter,
    queue: Vec<ReceivedMessage>,
}

/// Loopback [`Transport`].
#[derive(Debug)]
pub struct MemoryTransport {
    filters: Mutex<HashMap<FilterId, Installed>>,
    minimum_pow: f64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl MemoryTransport {
    /// Transport refusing envelopes below `minimum_pow`.
    pub fn new(minimum_pow: f64) -> Self {
        Self {
            filters: Mutex::new(HashMap::new()),
            minimum_pow,
        }
    }

    /// Number of installed filters.
    pub async fn filter_count(&self) -> usize {
        self.filters.lock().await.len()
    }

    fn new_filter_id() -> FilterId {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        FilterId(hex::encode(bytes))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn watch(&self, filter: Filter) -> Result<FilterId, TransportError> {
        if filter.topics.is_empty() {
            return Err(TransportError::Rejected("filter has no topics".to_string()));
        }
        let id = Self::new_filter_id();
        self.filters.lock().await.insert(
            id.clone(),
            Installed {
                filter,
                queue: Vec::new(),
            },
        );
        log::trace!("Installed filter {}", id);
        Ok(id)
    }

    async fn unwatch(&self, id: &FilterId) -> Result<(), TransportError> {
        match self.filters.lock().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(TransportError::UnknownFilter(id.clone())),
        }
    }

    async fn retrieve(&self, id: &FilterId) -> Result<Vec<ReceivedMessage>, TransportError> {
        let mut filters = self.filters.lock().await;
        let installed = filters
            .get_mut(id)
            .ok_or_else(|| TransportError::UnknownFilter(id.clone()))?;
        Ok(std::mem::take(&mut installed.queue))
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if envelope.ttl == 0 {
            return Err(TransportError::Rejected("ttl must be positive".to_string()));
        }
        if envelope.pow < self.minimum_pow {
            return Err(TransportError::Rejected(format!(
                "pow {} below minimum {}",
                envelope.pow, self.minimum_pow
            )));
        }
        if envelope.dst.is_none() && envelope.key_sym.is_none() {
            return Err(TransportError::Rejected("no recipient key".to_string()));
        }

        let src = envelope.src.as_ref().map(p256::SecretKey::public_key);
        let mut delivered = 0usize;
        let mut filters = self.filters.lock().await;
        for installed in filters.values_mut() {
            if !installed.filter.matches_topic(&envelope.topic) {
                continue;
            }
            let sym_key_hash = match (&installed.filter.key, &envelope.dst, &envelope.key_sym) {
                (FilterKey::Asymmetric(secret), Some(dst), _) if secret.public_key() == *dst => None,
                (FilterKey::Symmetric(key), None, Some(sym)) if key == sym => Some(key.hash()),
                _ => continue,
            };
            installed.queue.push(ReceivedMessage {
                topic: envelope.topic,
                payload: envelope.payload.clone(),
                src,
                dst: envelope.dst,
                sym_key_hash,
            });
            delivered += 1;
        }

        log::trace!("Envelope on {} delivered to {} filter(s)", envelope.topic, delivered);
        Ok(())
    }
}
