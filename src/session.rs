//! Voice session lifecycle, observers, and offline reconciliation
//!
//! The [`SessionManager`] is the only owner of the session arena and the sync queue.
//! Local state is always authoritative; the backend mirror is brought up to date by
//! the sync worker whenever connectivity allows.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::connectivity::ConnectivityProbe;
use crate::error::{Error, Result};
use crate::gateway::PersistenceGateway;
use crate::storage::Storage;
use crate::sync::{DeadLetter, SyncJob, SyncOp, SyncQueue, SyncQueueItem, run_worker};
use crate::types::{
    RemoteSessionId, SessionId, SessionMetadata, SessionType, VoiceEvent, VoiceEventType,
    VoiceSession,
};

/// Lifecycle notifications delivered to observers
#[derive(Debug, Clone)]
pub enum SessionNotification {
    SessionStarted(VoiceSession),
    SessionEnded(VoiceSession),
    EventAdded {
        session_id: SessionId,
        event: VoiceEvent,
    },
    OnlineStatusChanged(bool),
}

/// Receives session notifications; must not block
pub trait SessionObserver: Send + Sync {
    fn notify(&self, notification: &SessionNotification);
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionNotification) + Send + Sync,
{
    fn notify(&self, notification: &SessionNotification) {
        self(notification)
    }
}

pub type SubscriptionId = u64;

#[derive(Default)]
struct ObserverList {
    next_id: AtomicU64,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn SessionObserver>)>>,
}

impl ObserverList {
    fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    fn notify(&self, notification: SessionNotification) {
        // call outside the lock so an observer may subscribe or unsubscribe
        let observers: Vec<_> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.notify(&notification);
        }
    }
}

/// Arena of sessions keyed by client id, plus the one that is currently active
#[derive(Default)]
pub(crate) struct SessionStore {
    sessions: HashMap<SessionId, VoiceSession>,
    current: Option<SessionId>,
}

impl SessionStore {
    pub(crate) fn get(&self, id: &SessionId) -> Option<&VoiceSession> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut VoiceSession> {
        self.sessions.get_mut(id)
    }

    fn current(&self) -> Option<&VoiceSession> {
        self.current.and_then(|id| self.sessions.get(&id))
    }

    fn current_mut(&mut self) -> Option<&mut VoiceSession> {
        let id = self.current?;
        self.sessions.get_mut(&id)
    }
}

/// State shared between the manager handle and the sync worker
pub(crate) struct SessionShared {
    pub(crate) store: RwLock<SessionStore>,
    pub(crate) queue: Mutex<SyncQueue>,
    pub(crate) online: AtomicBool,
    pub(crate) gateway: Arc<dyn PersistenceGateway>,
}

/// Owns voice sessions and keeps their backend mirror eventually consistent
///
/// Cloning yields another handle onto the same sessions. Construction spawns the
/// sync worker, so it must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<SessionShared>,
    observers: Arc<ObserverList>,
    probe: Arc<dyn ConnectivityProbe>,
    jobs: mpsc::UnboundedSender<SyncJob>,
    session_timeout: chrono::Duration,
}

impl SessionManager {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        probe: Arc<dyn ConnectivityProbe>,
        config: &VoiceConfig,
    ) -> Self {
        Self::with_queue(gateway, probe, config, SyncQueue::new())
    }

    /// Like [`SessionManager::new`], with the sync queue mirrored to `storage`
    ///
    /// Items queued before a restart are restored in their original order and drained
    /// on the next connectivity-restored transition.
    pub fn with_storage(
        gateway: Arc<dyn PersistenceGateway>,
        probe: Arc<dyn ConnectivityProbe>,
        config: &VoiceConfig,
        storage: Arc<Storage>,
    ) -> Result<Self> {
        let queue = SyncQueue::with_storage(storage.clone())?;
        let remote_ids = storage.load_remote_sessions()?;
        let manager = Self::with_queue(gateway, probe, config, queue);
        let restored = manager.restore_pending_sessions(&remote_ids);
        storage.prune_remote_sessions(&restored)?;
        Ok(manager)
    }

    /// Rebuild completed stand-ins for sessions that still have queued items
    ///
    /// Only what the queue needs survives a restart: the session id, how to
    /// register it, its server id if it was registered, and the unsynced events.
    fn restore_pending_sessions(&self, remote_ids: &HashMap<SessionId, RemoteSessionId>) -> Vec<SessionId> {
        let items = self.shared.queue.lock().items();
        let mut store = self.shared.store.write();
        let mut restored = Vec::new();

        for item in items {
            let session = store.sessions.entry(item.session_id).or_insert_with(|| {
                restored.push(item.session_id);
                let mut session = VoiceSession::new(SessionType::default(), SessionMetadata::default());
                session.id = item.session_id;
                session.start_time = item.enqueued_at;
                session.remote_id = remote_ids.get(&item.session_id).cloned();
                session.complete();
                session
            });
            match item.op {
                SyncOp::RegisterSession {
                    session_type,
                    metadata,
                } => {
                    session.session_type = session_type;
                    session.metadata = metadata;
                }
                SyncOp::AppendEvent { event } => session.events.push(event),
                _ => {}
            }
        }

        if !restored.is_empty() {
            info!("Restored {} sessions with unsynced items", restored.len());
        }
        restored
    }

    fn with_queue(
        gateway: Arc<dyn PersistenceGateway>,
        probe: Arc<dyn ConnectivityProbe>,
        config: &VoiceConfig,
        queue: SyncQueue,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            store: RwLock::new(SessionStore::default()),
            queue: Mutex::new(queue),
            online: AtomicBool::new(probe.is_online()),
            gateway,
        });

        let (jobs, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(shared.clone(), receiver));

        let session_timeout = chrono::Duration::from_std(config.session_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(30 * 60));

        Self {
            shared,
            observers: Arc::new(ObserverList::default()),
            probe,
            jobs,
            session_timeout,
        }
    }

    // ========== Observers ==========

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    /// Returns false if the id was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // ========== Lifecycle ==========

    /// Start a new session, ending any session that is still active
    ///
    /// Registration with the backend happens in the background and never delays
    /// the returned session.
    pub fn start_session(&self, session_type: SessionType, metadata: SessionMetadata) -> VoiceSession {
        if self.shared.store.read().current().is_some() {
            self.end_session();
        }

        let session = VoiceSession::new(session_type, metadata);
        {
            let mut store = self.shared.store.write();
            store.sessions.insert(session.id, session.clone());
            store.current = Some(session.id);
        }
        info!("Started {:?} voice session {}", session_type, session.id);

        self.submit(SyncQueueItem::new(
            session.id,
            SyncOp::RegisterSession {
                session_type,
                metadata: session.metadata.clone(),
            },
        ));
        self.observers
            .notify(SessionNotification::SessionStarted(session.clone()));
        session
    }

    /// Complete the active session and return it; a no-op when none is active
    pub fn end_session(&self) -> Option<VoiceSession> {
        let event_count = self.shared.store.read().current()?.events.len();

        // final state travels through the normal event path
        let ended = VoiceEvent::new(
            VoiceEventType::System,
            json!({ "action": "session_ended", "event_count": event_count + 1 }),
        );
        if let Err(e) = self.add_event_to_session(ended) {
            warn!("Could not record session end: {}", e);
        }

        let session = {
            let mut store = self.shared.store.write();
            let id = store.current.take()?;
            let session = store.sessions.get_mut(&id)?;
            session.complete();
            session.clone()
        };
        info!(
            "Ended voice session {} with {} events",
            session.id,
            session.events.len()
        );

        self.observers
            .notify(SessionNotification::SessionEnded(session.clone()));
        Some(session)
    }

    /// Append an event to the active session and sync it
    pub fn add_event_to_session(&self, event: VoiceEvent) -> Result<()> {
        let session_id = {
            let mut store = self.shared.store.write();
            let session = store.current_mut().ok_or(Error::NoActiveSession)?;
            session.events.push(event.clone());
            session.id
        };
        debug!("Added {:?} event to session {}", event.event_type, session_id);

        self.submit(SyncQueueItem::new(
            session_id,
            SyncOp::AppendEvent {
                event: event.clone(),
            },
        ));
        self.observers
            .notify(SessionNotification::EventAdded { session_id, event });
        Ok(())
    }

    /// Queue a workout mutation whose interactive commit failed transiently
    pub fn enqueue_mutation(&self, op: SyncOp) -> Result<()> {
        let session_id = self.current_session_id().ok_or(Error::NoActiveSession)?;
        self.shared
            .queue
            .lock()
            .push_back(SyncQueueItem::new(session_id, op));
        Ok(())
    }

    /// End the active session and push out whatever can be synced now
    pub async fn shutdown(&self) -> Option<VoiceSession> {
        let session = self.end_session();
        self.sync_now();
        self.flush().await;
        session
    }

    // ========== Connectivity ==========

    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    /// Record a connectivity change pushed by the host
    ///
    /// Going online drains the queue in original enqueue order.
    pub fn handle_connectivity_change(&self, is_online: bool) {
        let was_online = self.shared.online.swap(is_online, Ordering::SeqCst);
        if was_online == is_online {
            return;
        }

        info!("Connectivity changed: online = {}", is_online);
        self.observers
            .notify(SessionNotification::OnlineStatusChanged(is_online));
        if is_online {
            self.sync_now();
        }
    }

    /// Read the probe and apply any change; returns the current state
    pub fn poll_connectivity(&self) -> bool {
        let online = self.probe.is_online();
        self.handle_connectivity_change(online);
        online
    }

    /// Ask the worker to drain the queue
    pub fn sync_now(&self) {
        self.send(SyncJob::Drain);
    }

    /// Wait until every sync job submitted so far has been handled
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(SyncJob::Flush(done));
        if wait.await.is_err() {
            warn!("Sync worker stopped before flush completed");
        }
    }

    // ========== Housekeeping ==========

    /// Evict completed sessions that ended longer ago than the session timeout
    pub fn clear_expired_sessions(&self) -> usize {
        self.clear_expired_sessions_at(Utc::now())
    }

    /// Eviction against an explicit clock
    ///
    /// Sessions that still have queued sync items are kept until those drain.
    pub fn clear_expired_sessions_at(&self, now: DateTime<Utc>) -> usize {
        let pending = self.shared.queue.lock().pending_sessions();
        let timeout = self.session_timeout;

        let mut store = self.shared.store.write();
        let before = store.sessions.len();
        store.sessions.retain(|id, session| {
            let expired = !session.is_active()
                && session
                    .end_time
                    .is_some_and(|ended| now.signed_duration_since(ended) > timeout);
            !expired || pending.contains(id)
        });
        let evicted = before - store.sessions.len();
        if evicted > 0 {
            info!("Evicted {} expired voice sessions", evicted);
        }
        evicted
    }

    // ========== Queries ==========

    pub fn current_session(&self) -> Option<VoiceSession> {
        self.shared.store.read().current().cloned()
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.shared.store.read().current
    }

    /// Type and workout of the active session, without cloning its events
    pub fn current_context(&self) -> Option<(SessionType, Option<String>)> {
        let store = self.shared.store.read();
        store
            .current()
            .map(|session| (session.session_type, session.metadata.workout_id.clone()))
    }

    pub fn session(&self, id: SessionId) -> Option<VoiceSession> {
        self.shared.store.read().get(&id).cloned()
    }

    /// All retained sessions, oldest first
    pub fn all_sessions(&self) -> Vec<VoiceSession> {
        let mut sessions: Vec<_> = self.shared.store.read().sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.start_time);
        sessions
    }

    pub fn sync_queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn sync_queue(&self) -> Vec<SyncQueueItem> {
        self.shared.queue.lock().items()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.queue.lock().dead_letters().to_vec()
    }

    fn submit(&self, item: SyncQueueItem) {
        if self.is_online() {
            self.send(SyncJob::Submit(item));
        } else {
            self.shared.queue.lock().push_back(item);
        }
    }

    fn send(&self, job: SyncJob) {
        if self.jobs.send(job).is_err() {
            warn!("Sync worker is gone; job dropped");
        }
    }
}
