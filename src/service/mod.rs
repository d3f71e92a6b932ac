//! The notification service: session tables, handshake handlers and
//! lifecycle.
//!
//! # Handshake
//!
//! ```text
//! client                               server
//!   │ Discover      (to server key)     │
//!   ├──────────────────────────────────►│ {server}
//!   │ Accept {server} (to server key)   │
//!   ├──────────────────────────────────►│ new client session, {key}
//!   │ NewChat {chat?} (client key)      │
//!   ├──────────────────────────────────►│ new chat session, {server, key}
//!   │ RegisterDevice {device} (chat key)│
//!   ├──────────────────────────────────►│ upsert device, {server}
//!   │ SendNotification (chat key)       │
//!   ├──────────────────────────────────►│ fan out to every other device
//! ```
//!
//! Every reply goes back on the request's topic, addressed to the
//! requester's public key and signed by the server identity.
//!
//! # Locking
//!
//! The client table, the chat table and each chat's device registry have
//! their own `RwLock`. Handlers clone what they need out of a table under a
//! read lock and only write-lock the one map they change. A device
//! registration keeps its chat's registry locked until the updated record
//! is stored. All requests are handled one at a time on the handler task
//! fed by [`dispatch`].
//!
//! # Persistence
//!
//! With a [`SessionPersistence`] configured, chat sessions (and optionally
//! client sessions) are written to the encrypted store on creation and on
//! every device registration, and reloaded by [`NotificationService::start`].

// Rust guideline compliant 2026-02

pub mod dispatch;
pub mod error;
pub mod phase;

use std::collections::HashMap;
use std::sync::Arc;

use p256::PublicKey;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::constants::DISPATCH_QUEUE_CAPACITY;
use crate::identity::ServerIdentity;
use crate::keys::{fingerprint, new_session_key, Hash, SessionKey};
use crate::notifier::{Notifier, NotifyError, ProviderResponse};
use crate::session::{ChatSession, ClientSession, Session, SessionKind, SessionStore};
use crate::transport::{Envelope, Filter, FilterId, ReceivedMessage, Transport};

pub use dispatch::{Dispatcher, Job};
pub use error::ServiceError;
pub use phase::{
    KeyPayload, NewChatRequest, NewChatResponse, Phase, PhaseTopics, RegisterDeviceRequest,
    ServerPayload,
};

/// Session store plus the passphrase its records are sealed with.
#[derive(Clone)]
pub struct SessionPersistence {
    store: SessionStore,
    passphrase: Zeroizing<String>,
}

impl std::fmt::Debug for SessionPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPersistence")
            .field("dir", &self.store.dir())
            .finish_non_exhaustive()
    }
}

impl SessionPersistence {
    /// Pair a store with its passphrase.
    pub fn new(store: SessionStore, passphrase: &str) -> Self {
        Self {
            store,
            passphrase: Zeroizing::new(passphrase.to_string()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    async fn put(&self, session: Session) -> Result<(), ServiceError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.store.put(&session, &this.passphrase)).await??;
        Ok(())
    }

    async fn get(&self, id: Hash) -> Result<Session, ServiceError> {
        let this = self.clone();
        let session =
            tokio::task::spawn_blocking(move || this.store.get(&id, &this.passphrase)).await??;
        Ok(session)
    }

    async fn list(&self) -> Result<Vec<Hash>, ServiceError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.list()).await??)
    }

    async fn delete(&self, id: Hash) -> Result<bool, ServiceError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.delete(&id)).await??)
    }
}

/// Push notification handshake server.
///
/// Construct with [`NotificationService::new`], then [`start`](Self::start)
/// it. Held in an `Arc` because the handler task keeps a reference until
/// [`stop`](Self::stop).
pub struct NotificationService {
    config: Config,
    identity: ServerIdentity,
    transport: Arc<dyn Transport>,
    notifier: Notifier,
    persistence: Option<SessionPersistence>,
    topics: PhaseTopics,

    client_sessions: RwLock<HashMap<Hash, ClientSession>>,
    chat_sessions: RwLock<HashMap<Hash, Arc<ChatSession>>>,
    session_filters: Mutex<HashMap<Hash, Vec<FilterId>>>,
    server_filters: Mutex<Vec<FilterId>>,

    dispatcher: Dispatcher,
    jobs: Mutex<Option<mpsc::Receiver<Job>>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationService")
            .field("identity", &self.identity)
            .field("persistence", &self.persistence)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl NotificationService {
    /// Build a stopped service.
    pub fn new(
        config: Config,
        identity: ServerIdentity,
        transport: Arc<dyn Transport>,
        notifier: Notifier,
        persistence: Option<SessionPersistence>,
    ) -> Arc<Self> {
        let (dispatcher, jobs) = Dispatcher::new(
            Arc::clone(&transport),
            config.poll_interval(),
            DISPATCH_QUEUE_CAPACITY,
        );
        Arc::new(Self {
            config,
            identity,
            transport,
            notifier,
            persistence,
            topics: PhaseTopics::derive(),
            client_sessions: RwLock::new(HashMap::new()),
            chat_sessions: RwLock::new(HashMap::new()),
            session_filters: Mutex::new(HashMap::new()),
            server_filters: Mutex::new(Vec::new()),
            dispatcher,
            jobs: Mutex::new(Some(jobs)),
            handler: Mutex::new(None),
        })
    }

    /// Server id clients must name.
    pub fn server_id(&self) -> &str {
        self.identity.server_id()
    }

    /// Public key clients address Discover and Accept requests to.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Topic of `phase`.
    pub fn topic(&self, phase: Phase) -> crate::topic::TopicId {
        self.topics.get(phase)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Install the server filters, restore persisted sessions and start
    /// handling requests.
    ///
    /// On failure everything this call installed or restored is removed
    /// again, so `start` can be retried.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        let jobs = self
            .jobs
            .lock()
            .await
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;

        let mut restored = Vec::new();
        if let Err(e) = self.install_and_restore(&mut restored).await {
            self.undo_start(&restored).await;
            *self.jobs.lock().await = Some(jobs);
            return Err(e);
        }

        let service = Arc::clone(self);
        let shutdown = self.dispatcher.shutdown_token();
        let handle = tokio::spawn(service.run_handler(jobs, shutdown));
        *self.handler.lock().await = Some(handle);

        log::info!(
            "Notification server '{}' started ({}), {} session(s) restored",
            self.server_id(),
            self.identity.fingerprint().short(),
            restored.len()
        );
        Ok(())
    }

    async fn install_and_restore(&self, restored: &mut Vec<Hash>) -> Result<(), ServiceError> {
        for phase in [Phase::Discover, Phase::Accept] {
            let filter = Filter::asymmetric(
                self.identity.secret_key().clone(),
                vec![self.topics.get(phase)],
            );
            let id = self.dispatcher.install(phase, filter).await?;
            self.server_filters.lock().await.push(id);
        }
        self.restore_sessions(restored).await
    }

    /// Remove the server filters and the sessions a failed `start` restored.
    /// Stored records are left alone.
    async fn undo_start(&self, restored: &[Hash]) {
        let server_filters = std::mem::take(&mut *self.server_filters.lock().await);
        for filter_id in server_filters {
            if let Err(e) = self.dispatcher.remove(&filter_id).await {
                log::debug!("Filter {} already removed: {}", filter_id, e);
            }
        }
        for id in restored {
            self.client_sessions.write().await.remove(id);
            self.chat_sessions.write().await.remove(id);
            self.remove_session_filters(id).await;
        }
        log::warn!("Start aborted, {} restored session(s) unloaded", restored.len());
    }

    /// Stop every worker and the handler task. Sessions stay in memory and
    /// on disk.
    pub async fn stop(&self) {
        self.dispatcher.shutdown().await;
        self.server_filters.lock().await.clear();
        if let Some(handle) = self.handler.lock().await.take() {
            if let Err(e) = handle.await {
                log::error!("Request handler failed: {}", e);
            }
        }
        log::info!("Notification server '{}' stopped", self.server_id());
    }

    async fn run_handler(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<Job>,
        shutdown: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                () = shutdown.cancelled() => break,
                job = jobs.recv() => job,
            };
            let Some(job) = job else { break };

            if let Err(e) = self.handle_message(job.phase, &job.message).await {
                if e.is_protocol() {
                    log::warn!("Dropped {} request: {}", job.phase, e);
                } else {
                    log::error!("Failed to handle {} request: {}", job.phase, e);
                }
            }
        }
        log::debug!("Request handler stopped");
    }

    async fn restore_sessions(&self, restored: &mut Vec<Hash>) -> Result<(), ServiceError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        for id in persistence.list().await? {
            if self.client_sessions.read().await.contains_key(&id)
                || self.chat_sessions.read().await.contains_key(&id)
            {
                continue;
            }
            let session = match persistence.get(id).await {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Skipping stored session {}: {}", id.short(), e);
                    continue;
                }
            };

            match session.kind {
                SessionKind::Client => match ClientSession::from_session(&session) {
                    Ok(client) => self.activate_client_session(client).await?,
                    Err(e) => {
                        log::warn!("Skipping stored session {}: {}", id.short(), e);
                        continue;
                    }
                },
                SessionKind::Chat => match ChatSession::from_session(&session) {
                    Ok(chat) => self.activate_chat_session(Arc::new(chat)).await?,
                    Err(e) => {
                        log::warn!("Skipping stored session {}: {}", id.short(), e);
                        continue;
                    }
                },
            }
            log::debug!("Restored {} session {}", session.kind, id.short());
            restored.push(id);
        }
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle one message drained from a filter installed for `phase`.
    ///
    /// Protocol errors mean the message was dropped; nothing was changed.
    pub async fn handle_message(
        &self,
        phase: Phase,
        message: &ReceivedMessage,
    ) -> Result<(), ServiceError> {
        match phase {
            Phase::Discover => self.handle_discover(message).await,
            Phase::Accept => self.handle_accept(message).await,
            Phase::NewChat => self.handle_new_chat(message).await,
            Phase::RegisterDevice => self.handle_register_device(message).await,
            Phase::SendNotification => self.handle_send_notification(message).await,
        }
    }

    async fn handle_discover(&self, message: &ReceivedMessage) -> Result<(), ServiceError> {
        let src = message.src.ok_or(ServiceError::MissingSender)?;
        let body = ServerPayload {
            server: self.server_id().to_string(),
        };
        self.reply(Phase::Discover, src, None, &body).await?;
        log::debug!("Answered discovery from {}", fingerprint(&src).short());
        Ok(())
    }

    async fn handle_accept(&self, message: &ReceivedMessage) -> Result<(), ServiceError> {
        let request: ServerPayload = serde_json::from_slice(&message.payload)?;
        if request.server != self.server_id() {
            return Err(ServiceError::WrongServer {
                requested: request.server,
                expected: self.server_id().to_string(),
            });
        }
        let src = message.src.ok_or(ServiceError::MissingSender)?;

        let key = self.register_client_session(fingerprint(&src)).await?;
        let body = KeyPayload { key: key.to_hex() };
        self.reply(Phase::Accept, src, None, &body).await
    }

    async fn handle_new_chat(&self, message: &ReceivedMessage) -> Result<(), ServiceError> {
        let src = message.src.ok_or(ServiceError::MissingSender)?;
        let request: NewChatRequest = parse_optional(&message.payload)?;

        let client_key = {
            let sessions = self.client_sessions.read().await;
            message
                .sym_key_hash
                .and_then(|id| sessions.get(&id))
                .map(|session| session.key.clone())
                .ok_or(ServiceError::UnknownSession(message.sym_key_hash))?
        };

        let chat_key = self
            .register_chat_session(fingerprint(&src), request.chat)
            .await?;
        let body = NewChatResponse {
            server: self.server_id().to_string(),
            key: chat_key.to_hex(),
        };
        self.reply(Phase::NewChat, src, Some(client_key), &body).await
    }

    async fn handle_register_device(&self, message: &ReceivedMessage) -> Result<(), ServiceError> {
        let request: RegisterDeviceRequest = serde_json::from_slice(&message.payload)?;
        let src = message.src.ok_or(ServiceError::MissingSender)?;
        if request.device.is_empty() {
            return Err(ServiceError::EmptyDevice);
        }
        let chat = self.chat_for(message.sym_key_hash).await?;

        self.register_device(&chat.key_hash(), fingerprint(&src), request.device)
            .await?;
        let body = ServerPayload {
            server: self.server_id().to_string(),
        };
        self.reply(Phase::RegisterDevice, src, Some(chat.key.clone()), &body)
            .await
    }

    async fn handle_send_notification(&self, message: &ReceivedMessage) -> Result<(), ServiceError> {
        let src = message.src.ok_or(ServiceError::MissingSender)?;
        let payload: serde_json::Value = parse_optional(&message.payload)?;
        let chat = self.chat_for(message.sym_key_hash).await?;

        match self.notify(&chat.key_hash(), &fingerprint(&src), &payload).await {
            Ok(response) => {
                log::info!(
                    "Notification for chat {}: {} sent, {} failed",
                    chat.key_hash().short(),
                    response.success,
                    response.failure
                );
                Ok(())
            }
            Err(ServiceError::Notify(NotifyError::NoTarget)) => {
                log::debug!("No devices to notify in chat {}", chat.key_hash().short());
                Ok(())
            }
            Err(ServiceError::Notify(e)) => {
                log::warn!("Cannot send notification: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create a client session for `client` and start listening for its
    /// NewChat requests. Returns the session key.
    pub async fn register_client_session(&self, client: Hash) -> Result<SessionKey, ServiceError> {
        let key = new_session_key()?;
        let session = ClientSession {
            key: key.clone(),
            client,
        };

        if self.config.persist_client_sessions {
            if let Some(persistence) = &self.persistence {
                persistence.put(session.to_session()).await?;
            }
        }
        let id = session.key_hash();
        if let Err(e) = self.activate_client_session(session).await {
            self.discard_stored(id).await;
            return Err(e);
        }

        log::info!("Client session {} created for {}", id.short(), client.short());
        Ok(key)
    }

    /// Create a chat session on behalf of `parent` and start listening for
    /// device registrations and notification requests. Returns the chat key.
    pub async fn register_chat_session(
        &self,
        parent: Hash,
        chat_id: Option<String>,
    ) -> Result<SessionKey, ServiceError> {
        let key = new_session_key()?;
        let chat = Arc::new(ChatSession::new(key.clone(), parent, chat_id));

        if self.config.persist_chat_sessions {
            if let Some(persistence) = &self.persistence {
                persistence.put(chat.to_session().await).await?;
            }
        }
        let id = chat.key_hash();
        if let Err(e) = self.activate_chat_session(chat).await {
            self.discard_stored(id).await;
            return Err(e);
        }

        log::info!("Chat session {} created by {}", id.short(), parent.short());
        Ok(key)
    }

    /// Register (or replace) the device token of `requester` in a chat.
    pub async fn register_device(
        &self,
        chat_id: &Hash,
        requester: Hash,
        token: String,
    ) -> Result<(), ServiceError> {
        let chat = self.chat_for(Some(*chat_id)).await?;

        // The write guard is held until the record is on disk, so snapshots
        // of one chat are stored in the order they were taken.
        let mut devices = chat.devices.write().await;
        let replaced = devices.register(requester, token);
        if self.config.persist_chat_sessions {
            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.put(chat.snapshot(&devices)).await {
                    match replaced {
                        Some(previous) => devices.register(requester, previous),
                        None => devices.remove(&requester),
                    };
                    return Err(e);
                }
            }
        }
        drop(devices);

        if replaced.is_some() {
            log::info!("Device of {} replaced in chat {}", requester.short(), chat_id.short());
        } else {
            log::info!("Device of {} registered in chat {}", requester.short(), chat_id.short());
        }
        Ok(())
    }

    /// Notify every device in a chat except the requester's.
    ///
    /// Returns [`NotifyError::NoTarget`] (wrapped) if nobody else is registered.
    pub async fn notify(
        &self,
        chat_id: &Hash,
        requester: &Hash,
        payload: &serde_json::Value,
    ) -> Result<ProviderResponse, ServiceError> {
        let chat = self.chat_for(Some(*chat_id)).await?;
        let targets = chat.devices.read().await.targets_excluding(requester);
        Ok(self.notifier.send(&targets, payload).await?)
    }

    /// Drop a client session, its filter and its stored record.
    pub async fn remove_client_session(&self, id: &Hash) -> Result<bool, ServiceError> {
        let removed = self.client_sessions.write().await.remove(id).is_some();
        self.remove_session_filters(id).await;
        let deleted = self.delete_stored(*id).await?;
        if removed {
            log::info!("Client session {} removed", id.short());
        }
        Ok(removed || deleted)
    }

    /// Drop a chat session, its filters and its stored record.
    pub async fn remove_chat_session(&self, id: &Hash) -> Result<bool, ServiceError> {
        let removed = self.chat_sessions.write().await.remove(id).is_some();
        self.remove_session_filters(id).await;
        let deleted = self.delete_stored(*id).await?;
        if removed {
            log::info!("Chat session {} removed", id.short());
        }
        Ok(removed || deleted)
    }

    /// Number of live client sessions.
    pub async fn client_session_count(&self) -> usize {
        self.client_sessions.read().await.len()
    }

    /// Ids of live chat sessions.
    pub async fn chat_session_ids(&self) -> Vec<Hash> {
        let mut ids: Vec<Hash> = self.chat_sessions.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// A live chat session.
    pub async fn chat_session(&self, id: &Hash) -> Option<Arc<ChatSession>> {
        self.chat_sessions.read().await.get(id).cloned()
    }

    async fn chat_for(&self, id: Option<Hash>) -> Result<Arc<ChatSession>, ServiceError> {
        let sessions = self.chat_sessions.read().await;
        id.and_then(|id| sessions.get(&id))
            .map(Arc::clone)
            .ok_or(ServiceError::UnknownSession(id))
    }

    async fn activate_client_session(&self, session: ClientSession) -> Result<(), ServiceError> {
        let id = session.key_hash();
        let key = session.key.clone();
        self.client_sessions.write().await.insert(id, session);
        if let Err(e) = self.install_session_filters(id, &key, &[Phase::NewChat]).await {
            self.client_sessions.write().await.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn activate_chat_session(&self, chat: Arc<ChatSession>) -> Result<(), ServiceError> {
        let id = chat.key_hash();
        let key = chat.key.clone();
        self.chat_sessions.write().await.insert(id, chat);
        let phases = [Phase::RegisterDevice, Phase::SendNotification];
        if let Err(e) = self.install_session_filters(id, &key, &phases).await {
            self.chat_sessions.write().await.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn install_session_filters(
        &self,
        id: Hash,
        key: &SessionKey,
        phases: &[Phase],
    ) -> Result<(), ServiceError> {
        let mut installed = Vec::with_capacity(phases.len());
        for phase in phases {
            let filter = Filter::symmetric(key.clone(), vec![self.topics.get(*phase)]);
            match self.dispatcher.install(*phase, filter).await {
                Ok(filter_id) => installed.push(filter_id),
                Err(e) => {
                    for filter_id in &installed {
                        if let Err(e) = self.dispatcher.remove(filter_id).await {
                            log::debug!("Filter {} already removed: {}", filter_id, e);
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        self.session_filters
            .lock()
            .await
            .entry(id)
            .or_default()
            .extend(installed);
        Ok(())
    }

    async fn remove_session_filters(&self, id: &Hash) {
        let filters = self.session_filters.lock().await.remove(id).unwrap_or_default();
        for filter_id in filters {
            if let Err(e) = self.dispatcher.remove(&filter_id).await {
                log::debug!("Filter {} already removed: {}", filter_id, e);
            }
        }
    }

    async fn delete_stored(&self, id: Hash) -> Result<bool, ServiceError> {
        match &self.persistence {
            Some(persistence) => persistence.delete(id).await,
            None => Ok(false),
        }
    }

    async fn discard_stored(&self, id: Hash) {
        if let Err(e) = self.delete_stored(id).await {
            log::warn!("Failed to discard stored session {}: {}", id.short(), e);
        }
    }

    async fn reply<T: Serialize>(
        &self,
        phase: Phase,
        dst: PublicKey,
        key_sym: Option<SessionKey>,
        body: &T,
    ) -> Result<(), ServiceError> {
        let envelope = Envelope {
            topic: self.topics.get(phase),
            payload: serde_json::to_vec(body)?,
            src: Some(self.identity.secret_key().clone()),
            dst: Some(dst),
            key_sym,
            ttl: self.config.ttl,
            pow: self.config.minimum_pow,
        };
        self.transport.send(envelope).await?;
        log::debug!("Sent {} response to {}", phase, fingerprint(&dst).short());
        Ok(())
    }
}

/// Parse a JSON body that may be empty.
fn parse_optional<T: Default + serde::de::DeserializeOwned>(
    payload: &[u8],
) -> Result<T, serde_json::Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        serde_json::from_slice(payload)
    }
}
