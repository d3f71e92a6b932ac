//! Filter polling workers.
//!
//! Every installed filter gets one tokio task that ticks at the poll
//! interval, drains the filter and forwards each message as a [`Job`] over
//! a bounded queue. A single handler task (owned by the service) consumes
//! the queue, so session state is only ever mutated from one place.
//!
//! ```text
//! worker(filter A) ─┐
//! worker(filter B) ─┼─► mpsc<Job> ─► handler task ─► NotificationService
//! worker(filter C) ─┘
//! ```
//!
//! Each worker holds a child of the dispatcher's shutdown token, so a
//! single cancel stops them all; removing one filter cancels only its own.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::phase::Phase;
use crate::transport::{Filter, FilterId, ReceivedMessage, Transport, TransportError};

/// A drained message tagged with the phase of its filter.
#[derive(Debug)]
pub struct Job {
    /// Phase the filter was installed for.
    pub phase: Phase,
    /// The message.
    pub message: ReceivedMessage,
}

#[derive(Debug)]
struct Worker {
    phase: Phase,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of all filter workers.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
    jobs: mpsc::Sender<Job>,
    shutdown: CancellationToken,
    workers: Mutex<HashMap<FilterId, Worker>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("poll_interval", &self.poll_interval)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// New dispatcher and the receiving end of its job queue.
    pub fn new(
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Job>) {
        let (jobs, rx) = mpsc::channel(capacity);
        let dispatcher = Self {
            transport,
            poll_interval,
            jobs,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
        };
        (dispatcher, rx)
    }

    /// Token cancelled on [`Dispatcher::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install `filter` on the transport and start polling it for `phase`.
    pub async fn install(&self, phase: Phase, filter: Filter) -> Result<FilterId, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Unavailable("dispatcher stopped".to_string()));
        }
        let id = self.transport.watch(filter).await?;
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(poll_filter(
            Arc::clone(&self.transport),
            id.clone(),
            phase,
            self.jobs.clone(),
            cancel.clone(),
            self.poll_interval,
        ));

        self.workers.lock().await.insert(
            id.clone(),
            Worker {
                phase,
                cancel,
                handle,
            },
        );
        log::debug!("Polling filter {} for {}", id, phase);
        Ok(id)
    }

    /// Stop polling `id` and remove it from the transport.
    pub async fn remove(&self, id: &FilterId) -> Result<(), TransportError> {
        let worker = self.workers.lock().await.remove(id);
        if let Some(worker) = worker {
            worker.cancel.cancel();
            match worker.handle.await {
                Ok(()) => log::debug!("Stopped {} worker for filter {}", worker.phase, id),
                Err(e) => log::error!("{} worker for filter {} failed: {}", worker.phase, id, e),
            }
        }
        self.transport.unwatch(id).await
    }

    /// Number of running workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Cancel every worker, wait for them and remove their filters.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<(FilterId, Worker)> = self.workers.lock().await.drain().collect();
        for (id, worker) in workers {
            if let Err(e) = worker.handle.await {
                log::error!("{} worker for filter {} failed: {}", worker.phase, id, e);
            }
            if let Err(e) = self.transport.unwatch(&id).await {
                log::debug!("Filter {} already gone: {}", id, e);
            }
        }
        log::info!("Dispatcher stopped");
    }
}

async fn poll_filter(
    transport: Arc<dyn Transport>,
    id: FilterId,
    phase: Phase,
    jobs: mpsc::Sender<Job>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let messages = match transport.retrieve(&id).await {
            Ok(messages) => messages,
            Err(TransportError::UnknownFilter(_)) => {
                log::warn!("Filter {} disappeared, stopping {} worker", id, phase);
                break;
            }
            Err(e) => {
                log::warn!("Failed to poll filter {}: {}", id, e);
                continue;
            }
        };

        for message in messages {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                sent = jobs.send(Job { phase, message }) => {
                    if sent.is_err() {
                        log::debug!("Job queue closed, stopping {} worker", phase);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::new_session_key;
    use crate::transport::{Envelope, MemoryTransport};

    fn dispatcher() -> (Arc<MemoryTransport>, Dispatcher, mpsc::Receiver<Job>) {
        let transport = Arc::new(MemoryTransport::default());
        let (dispatcher, rx) = Dispatcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_millis(5),
            16,
        );
        (transport, dispatcher, rx)
    }

    #[tokio::test]
    async fn test_worker_forwards_messages_with_phase() {
        let (transport, dispatcher, mut rx) = dispatcher();
        let key = new_session_key().unwrap();
        let topic = Phase::RegisterDevice.topic();
        dispatcher
            .install(Phase::RegisterDevice, Filter::symmetric(key.clone(), vec![topic]))
            .await
            .unwrap();

        transport
            .send(Envelope {
                topic,
                payload: b"{}".to_vec(),
                src: None,
                dst: None,
                key_sym: Some(key.clone()),
                ttl: 10,
                pow: 0.0,
            })
            .await
            .unwrap();

        let job = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.phase, Phase::RegisterDevice);
        assert_eq!(job.message.sym_key_hash, Some(key.hash()));
    }

    #[tokio::test]
    async fn test_remove_stops_worker_and_unwatches() {
        let (transport, dispatcher, _rx) = dispatcher();
        let id = dispatcher
            .install(
                Phase::NewChat,
                Filter::symmetric(new_session_key().unwrap(), vec![Phase::NewChat.topic()]),
            )
            .await
            .unwrap();
        assert_eq!(dispatcher.worker_count().await, 1);

        dispatcher.remove(&id).await.unwrap();
        assert_eq!(dispatcher.worker_count().await, 0);
        assert_eq!(transport.filter_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_workers() {
        let (transport, dispatcher, _rx) = dispatcher();
        for phase in [Phase::RegisterDevice, Phase::SendNotification] {
            dispatcher
                .install(
                    phase,
                    Filter::symmetric(new_session_key().unwrap(), vec![phase.topic()]),
                )
                .await
                .unwrap();
        }

        dispatcher.shutdown().await;
        assert!(dispatcher.shutdown_token().is_cancelled());
        assert_eq!(dispatcher.worker_count().await, 0);
        assert_eq!(transport.filter_count().await, 0);
    }

    /// Transport whose polling panics.
    struct CrashingTransport(MemoryTransport);

    #[async_trait::async_trait]
    impl Transport for CrashingTransport {
        async fn watch(&self, filter: Filter) -> Result<FilterId, TransportError> {
            self.0.watch(filter).await
        }

        async fn unwatch(&self, id: &FilterId) -> Result<(), TransportError> {
            self.0.unwatch(id).await
        }

        async fn retrieve(&self, _id: &FilterId) -> Result<Vec<ReceivedMessage>, TransportError> {
            panic!("node crashed")
        }

        async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
            self.0.send(envelope).await
        }
    }

    #[tokio::test]
    async fn test_panicked_worker_is_reaped_on_remove_and_shutdown() {
        let transport = Arc::new(CrashingTransport(MemoryTransport::default()));
        let (dispatcher, _rx) = Dispatcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_millis(5),
            16,
        );
        let mut ids = Vec::new();
        for phase in [Phase::RegisterDevice, Phase::SendNotification] {
            let filter = Filter::symmetric(new_session_key().unwrap(), vec![phase.topic()]);
            ids.push(dispatcher.install(phase, filter).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        dispatcher.remove(&ids[0]).await.unwrap();
        assert_eq!(dispatcher.worker_count().await, 1);
        assert_eq!(transport.0.filter_count().await, 1);

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.worker_count().await, 0);
        assert_eq!(transport.0.filter_count().await, 0);
    }
}
