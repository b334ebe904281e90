//! Offline sync queue and the background worker that drains it
//!
//! Everything the core sends to the [`PersistenceGateway`](crate::gateway::PersistenceGateway)
//! outside of an interactive commit goes through here. Items leave the queue only on
//! success or when the backend rejects them outright, in which case they are kept in
//! the dead-letter list.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::SessionShared;
use crate::storage::Storage;
use crate::types::{RemoteSessionId, SessionId, SessionMetadata, SessionType, SetDraft, VoiceEvent};

/// A single gateway call waiting to be made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOp {
    /// Create the remote mirror of the session
    RegisterSession {
        session_type: SessionType,
        metadata: SessionMetadata,
    },
    AppendEvent { event: VoiceEvent },
    CommitSet { workout_id: String, draft: SetDraft },
    AmendSet { workout_id: String, draft: SetDraft },
    RevertLastSet { workout_id: String },
}

impl SyncOp {
    /// Workout mutations must reach the backend in the order they were confirmed
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            Self::CommitSet { .. } | Self::AmendSet { .. } | Self::RevertLastSet { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterSession { .. } => "register_session",
            Self::AppendEvent { .. } => "append_event",
            Self::CommitSet { .. } => "commit_set",
            Self::AmendSet { .. } => "amend_set",
            Self::RevertLastSet { .. } => "revert_last_set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub session_id: SessionId,
    pub op: SyncOp,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl SyncQueueItem {
    pub fn new(session_id: SessionId, op: SyncOp) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            op,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The voice event carried by this item, if it is an event append
    pub fn event(&self) -> Option<&VoiceEvent> {
        match &self.op {
            SyncOp::AppendEvent { event } => Some(event),
            _ => None,
        }
    }
}

/// An item the backend refused and that will not be retried
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub item: SyncQueueItem,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// FIFO of pending gateway calls, optionally mirrored to SQLite
#[derive(Default)]
pub struct SyncQueue {
    items: VecDeque<SyncQueueItem>,
    dead_letters: Vec<DeadLetter>,
    storage: Option<Arc<Storage>>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach durable storage, restoring whatever was queued before a restart
    pub fn with_storage(storage: Arc<Storage>) -> Result<Self> {
        let items: VecDeque<_> = storage.load_sync_queue()?.into();
        let dead_letters = storage.get_dead_letters()?;
        if !items.is_empty() {
            info!("Restored {} queued sync items", items.len());
        }
        Ok(Self {
            items,
            dead_letters,
            storage: Some(storage),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&SyncQueueItem> {
        self.items.front()
    }

    pub fn items(&self) -> Vec<SyncQueueItem> {
        self.items.iter().cloned().collect()
    }

    /// Sessions that still have something waiting to sync
    pub fn pending_sessions(&self) -> HashSet<SessionId> {
        self.items.iter().map(|item| item.session_id).collect()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    pub fn push_back(&mut self, item: SyncQueueItem) {
        if let Some(storage) = &self.storage {
            // the in-memory copy still holds the item if this fails
            if let Err(e) = storage.save_sync_item(&item) {
                error!("Failed to persist sync item {}: {}", item.id, e);
            }
        }
        debug!(
            "Queued {} for session {} (retry {})",
            item.op.name(),
            item.session_id,
            item.retry_count
        );
        self.items.push_back(item);
    }

    /// Drop the front item after it synced
    pub fn complete_front(&mut self) -> Option<SyncQueueItem> {
        let item = self.items.pop_front()?;
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_sync_item(item.id) {
                error!("Failed to remove synced item {}: {}", item.id, e);
            }
        }
        Some(item)
    }

    /// Move the front item to the back with its retry count bumped
    pub fn requeue_front(&mut self) {
        if let Some(mut item) = self.items.pop_front() {
            item.retry_count += 1;
            self.push_back(item);
        }
    }

    /// Count a failed attempt on the front item and leave it where it is
    pub fn hold_front(&mut self) {
        let Some(item) = self.items.front_mut() else {
            return;
        };
        item.retry_count += 1;
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.update_retry_count(item.id, item.retry_count) {
                error!("Failed to persist retry count of {}: {}", item.id, e);
            }
        }
    }

    /// Move the front item to the dead-letter list
    pub fn dead_letter_front(&mut self, error: &Error) {
        if let Some(item) = self.complete_front() {
            self.push_dead_letter(item, error);
        }
    }

    /// Keep the server id of a registered session across restarts
    pub fn remember_remote_id(&self, session_id: SessionId, remote_id: &RemoteSessionId) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_remote_session(session_id, remote_id) {
                error!("Failed to persist remote id of session {}: {}", session_id, e);
            }
        }
    }

    fn push_dead_letter(&mut self, item: SyncQueueItem, error: &Error) {
        warn!(
            "Dropping {} for session {} after rejection: {}",
            item.op.name(),
            item.session_id,
            error
        );
        let letter = DeadLetter {
            item,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_dead_letter(&letter) {
                error!("Failed to persist dead letter: {}", e);
            }
        }
        self.dead_letters.push(letter);
    }
}

/// Work handed to the sync worker
pub(crate) enum SyncJob {
    /// Try the item now, falling back to the queue
    Submit(SyncQueueItem),
    /// Try to empty the queue
    Drain,
    /// Reply once every earlier job has been handled
    Flush(oneshot::Sender<()>),
}

/// Background task that owns every gateway call made on behalf of sessions
///
/// Jobs are handled one at a time, so queue order is never raced.
pub(crate) async fn run_worker(
    shared: Arc<SessionShared>,
    mut jobs: mpsc::UnboundedReceiver<SyncJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            SyncJob::Submit(item) => submit(&shared, item).await,
            SyncJob::Drain => drain(&shared).await,
            SyncJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Sync worker shutting down");
}

async fn submit(shared: &SessionShared, item: SyncQueueItem) {
    let queue_busy = !shared.queue.lock().is_empty();
    if !shared.online.load(Ordering::SeqCst) || queue_busy {
        // keep original order behind anything already waiting
        shared.queue.lock().push_back(item);
        if queue_busy {
            drain(shared).await;
        }
        return;
    }

    match attempt(shared, &item).await {
        Ok(()) => {}
        Err(e) if e.is_retryable() => {
            warn!("Sync of {} failed, queueing: {}", item.op.name(), e);
            let mut item = item;
            item.retry_count += 1;
            shared.queue.lock().push_back(item);
        }
        Err(e) => shared.queue.lock().push_dead_letter(item, &e),
    }
}

/// Sync queued items front to back
///
/// A failed event append goes to the back so it cannot block the rest. A failed
/// workout mutation stays at the front and ends the drain, since anything confirmed
/// after it depends on it. Also stops when the queue is empty, connectivity drops, or
/// every remaining item failed since the last success.
async fn drain(shared: &SessionShared) {
    let total = shared.queue.lock().len();
    if total == 0 {
        return;
    }
    info!("Draining {} queued sync items", total);

    let mut failures_in_a_row = 0;
    let mut synced = 0;
    loop {
        if !shared.online.load(Ordering::SeqCst) {
            debug!("Went offline mid-drain");
            break;
        }
        let Some(item) = shared.queue.lock().front().cloned() else {
            break;
        };

        match attempt(shared, &item).await {
            Ok(()) => {
                shared.queue.lock().complete_front();
                failures_in_a_row = 0;
                synced += 1;
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Retry {} of {} failed: {}",
                    item.retry_count + 1,
                    item.op.name(),
                    e
                );
                let mut queue = shared.queue.lock();
                if item.op.is_ordered() {
                    queue.hold_front();
                    break;
                }
                queue.requeue_front();
                failures_in_a_row += 1;
                if failures_in_a_row >= queue.len() {
                    break;
                }
            }
            Err(e) => shared.queue.lock().dead_letter_front(&e),
        }
    }

    let remaining = shared.queue.lock().len();
    info!("Drain finished: {} synced, {} remaining", synced, remaining);
}

/// Make the gateway call an item stands for
async fn attempt(shared: &SessionShared, item: &SyncQueueItem) -> Result<()> {
    let gateway = &shared.gateway;
    match &item.op {
        SyncOp::RegisterSession {
            session_type,
            metadata,
        } => {
            let registered = shared
                .store
                .read()
                .get(&item.session_id)
                .is_some_and(|session| session.remote_id.is_some());
            if registered {
                return Ok(());
            }
            let remote_id = gateway.create_session(*session_type, metadata).await?;
            info!("Session {} registered as {}", item.session_id, remote_id);
            shared.queue.lock().remember_remote_id(item.session_id, &remote_id);
            if let Some(session) = shared.store.write().get_mut(&item.session_id) {
                session.remote_id = Some(remote_id);
            }
            Ok(())
        }
        SyncOp::AppendEvent { event } => {
            let remote_id = {
                let store = shared.store.read();
                let session = store
                    .get(&item.session_id)
                    .ok_or_else(|| Error::SessionNotFound(item.session_id.to_string()))?;
                session.remote_id.clone().ok_or_else(|| {
                    Error::Transient(format!("session {} not registered yet", item.session_id))
                })?
            };
            gateway.append_event(&remote_id, event).await
        }
        SyncOp::CommitSet { workout_id, draft } => {
            let set_id = gateway.commit_set(workout_id, draft).await?;
            debug!("Queued set {} committed as {}", draft.client_id, set_id);
            Ok(())
        }
        SyncOp::AmendSet { workout_id, draft } => gateway.amend_set(workout_id, draft).await,
        SyncOp::RevertLastSet { workout_id } => {
            let reverted = gateway.revert_last_set(workout_id).await?;
            debug!("Queued revert on {} returned {}", workout_id, reverted);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VoiceEventType, VoiceSession};

    fn event_item(session_id: SessionId) -> SyncQueueItem {
        let event = VoiceEvent::new(VoiceEventType::System, serde_json::json!({}));
        SyncQueueItem::new(session_id, SyncOp::AppendEvent { event })
    }

    #[test]
    fn test_requeue_front_moves_to_back() {
        let mut queue = SyncQueue::new();
        let session = Uuid::new_v4();
        let a = event_item(session);
        let b = event_item(session);
        queue.push_back(a.clone());
        queue.push_back(b.clone());

        queue.requeue_front();
        let items = queue.items();
        assert_eq!(items[0].id, b.id);
        assert_eq!(items[1].id, a.id);
        assert_eq!(items[1].retry_count, 1);
    }

    #[test]
    fn test_hold_front_keeps_mutation_first() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut queue = SyncQueue::with_storage(storage.clone()).unwrap();
        let session = Uuid::new_v4();
        let revert = SyncQueueItem::new(
            session,
            SyncOp::RevertLastSet {
                workout_id: "w1".to_string(),
            },
        );
        let event = event_item(session);
        queue.push_back(revert.clone());
        queue.push_back(event.clone());

        queue.hold_front();
        let items = queue.items();
        assert_eq!(items[0].id, revert.id);
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[1].id, event.id);

        let stored = storage.load_sync_queue().unwrap();
        assert_eq!(stored[0].id, revert.id);
        assert_eq!(stored[0].retry_count, 1);
    }

    #[test]
    fn test_only_mutations_are_ordered() {
        assert!(SyncOp::RevertLastSet { workout_id: "w1".to_string() }.is_ordered());
        assert!(!event_item(Uuid::new_v4()).op.is_ordered());
    }

    #[test]
    fn test_dead_letter_front() {
        let mut queue = SyncQueue::new();
        let item = event_item(Uuid::new_v4());
        queue.push_back(item.clone());
        queue.dead_letter_front(&Error::Validation("bad payload".into()));
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.dead_letters()[0].item.id, item.id);
    }

    #[test]
    fn test_queue_survives_restart() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let session = Uuid::new_v4();
        let first = event_item(session);
        let second = SyncQueueItem::new(
            session,
            SyncOp::RegisterSession {
                session_type: SessionType::Workout,
                metadata: SessionMetadata::for_user("u1"),
            },
        );
        {
            let mut queue = SyncQueue::with_storage(storage.clone()).unwrap();
            queue.push_back(first.clone());
            queue.push_back(second.clone());
            queue.complete_front();
            queue.push_back(first.clone());
        }

        let restored = SyncQueue::with_storage(storage).unwrap();
        let ids: Vec<_> = restored.items().iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert!(restored.pending_sessions().contains(&session));
    }

    #[test]
    fn test_op_serialization_is_tagged() {
        let op = SyncOp::RevertLastSet {
            workout_id: "w1".to_string(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "revert_last_set");
        assert_eq!(json["workout_id"], "w1");

        let item = event_item(VoiceSession::new(Default::default(), Default::default()).id);
        assert!(item.event().is_some());
    }
}
