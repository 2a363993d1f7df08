//! Offline action queue
//!
//! An ordered, persisted list of mutations waiting to reach the server. The
//! whole list lives under one key in the `action_queue` namespace and is
//! rewritten after every change, so the order on disk is the enqueue order.
//!
//! ## Draining
//!
//! Only one drain pass runs at a time; a concurrent call returns immediately
//! with `skipped` set. A pass walks the queue in FIFO order and hands each due
//! action to the caller's `send`:
//!
//! - `Ok` removes the action
//! - `Retryable` bumps `retryCount` and schedules the next attempt with
//!   exponential backoff, or drops the action once the budget is spent
//! - `Fatal` drops the action
//! - `Paused` ends the pass without touching the action
//!
//! Actions for one entity never overtake each other: once an action is
//! waiting for a retry, later actions for the same entity wait too.

mod action;

pub use action::{ActionKind, QueuedAction, DEFAULT_MAX_RETRIES};

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::cache::EntityKey;
use crate::clock::Clock;
use crate::notify::{Notification, Notifier};
use crate::storage::{
    DurableStore, StorageError, StorageResult, TransactionalStore, QUEUE_NAMESPACE,
};

/// Key of the persisted action list inside the queue namespace
const PENDING_KEY: &str = "pending";

/// Retry and eviction policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Actions older than this are purged at load without being sent
    pub eviction_horizon: chrono::Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            eviction_horizon: chrono::Duration::hours(24),
        }
    }
}

/// Outcome reported by a drain's `send` callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// Transient; try again later
    #[error("retryable: {0}")]
    Retryable(String),
    /// Will never succeed; abandon the action
    #[error("fatal: {0}")]
    Fatal(String),
    /// Stop this pass and keep the action as-is
    #[error("paused: {0}")]
    Paused(String),
}

/// An action removed without reaching the server
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedAction {
    pub action: QueuedAction,
    pub reason: String,
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Ids of actions the server accepted
    pub sent: Vec<String>,
    /// Ids of actions scheduled for another attempt
    pub rescheduled: Vec<String>,
    pub dropped: Vec<DroppedAction>,
    /// Actions left alone because they, or an earlier action for the same
    /// entity, were not due yet
    pub deferred: usize,
    /// Another drain was already running
    pub skipped: bool,
    /// Reason the pass stopped early, if it did
    pub paused: Option<String>,
    /// Time until the earliest scheduled retry
    pub next_retry_in: Option<Duration>,
}

enum RetryOutcome {
    Scheduled(Duration),
    Exhausted(QueuedAction),
    Gone,
}

/// Persisted FIFO of pending mutations
pub struct ActionQueue {
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    settings: QueueSettings,
    actions: Mutex<Vec<QueuedAction>>,
    size_tx: watch::Sender<usize>,
    drain_gate: tokio::sync::Mutex<()>,
    persist_gate: tokio::sync::Mutex<()>,
}

impl ActionQueue {
    /// Restore the queue from `store`, evicting anything past the horizon
    pub async fn load(
        store: Arc<dyn TransactionalStore>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        settings: QueueSettings,
    ) -> StorageResult<Self> {
        let persisted = match store.get(QUEUE_NAMESPACE, PENDING_KEY).await? {
            Some(value) => serde_json::from_value::<Vec<QueuedAction>>(value).map_err(|e| {
                StorageError::CorruptValue {
                    namespace: QUEUE_NAMESPACE.to_string(),
                    key: PENDING_KEY.to_string(),
                    details: e.to_string(),
                }
            })?,
            None => Vec::new(),
        };

        let now = clock.now();
        let total = persisted.len();
        let kept: Vec<QueuedAction> = persisted
            .into_iter()
            .filter(|action| action.age(now) <= settings.eviction_horizon)
            .collect();
        let evicted = total - kept.len();

        let (size_tx, _rx) = watch::channel(kept.len());
        let queue = Self {
            store,
            clock,
            notifier,
            settings,
            actions: Mutex::new(kept),
            size_tx,
            drain_gate: tokio::sync::Mutex::new(()),
            persist_gate: tokio::sync::Mutex::new(()),
        };

        if evicted > 0 {
            info!("Evicted {} stale queued actions", evicted);
            queue.persist().await?;
        }
        debug!("Loaded action queue with {} pending actions", queue.size());

        Ok(queue)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Build an action stamped with the queue's clock and retry budget
    pub fn new_action(&self, kind: ActionKind, entity: &EntityKey, payload: serde_json::Value) -> QueuedAction {
        QueuedAction::new(kind, entity, payload, self.clock.now())
            .with_max_retries(self.settings.max_retries)
    }

    /// Append an action; it is durable once this returns `Ok`
    pub async fn enqueue(&self, action: QueuedAction) -> StorageResult<String> {
        let id = action.id.clone();
        {
            let mut actions = self.lock();
            if actions.iter().any(|a| a.id == id) {
                return Ok(id);
            }
            actions.push(action);
        }

        if let Err(e) = self.persist().await {
            self.lock().retain(|a| a.id != id);
            warn!("Failed to persist queued action {}: {}", id, e);
            return Err(e);
        }

        self.publish_size();
        debug!("Queued action {}", id);
        Ok(id)
    }

    /// Pending action count
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn watch_size(&self) -> watch::Receiver<usize> {
        self.size_tx.subscribe()
    }

    /// Ordered copy of the pending actions
    pub fn snapshot(&self) -> Vec<QueuedAction> {
        self.lock().clone()
    }

    pub async fn clear(&self) -> StorageResult<()> {
        let _gate = self.persist_gate.lock().await;
        self.store.delete(QUEUE_NAMESPACE, PENDING_KEY).await?;
        self.lock().clear();
        self.publish_size();
        info!("Cleared action queue");
        Ok(())
    }

    /// Remove specific actions; returns how many were present
    pub async fn discard(&self, ids: &[String]) -> StorageResult<usize> {
        let removed = {
            let mut actions = self.lock();
            let before = actions.len();
            actions.retain(|a| !ids.contains(&a.id));
            before - actions.len()
        };
        if removed > 0 {
            self.persist().await?;
            self.publish_size();
        }
        Ok(removed)
    }

    /// Point queued actions for `old_id` at the server-assigned `new_id`
    pub async fn rekey_entity(&self, entity_type: &str, old_id: &str, new_id: &str) -> StorageResult<usize> {
        let changed = {
            let mut actions = self.lock();
            let mut changed = 0;
            for action in actions
                .iter_mut()
                .filter(|a| a.entity_type == entity_type && a.entity_id == old_id)
            {
                action.entity_id = new_id.to_string();
                changed += 1;
            }
            changed
        };
        if changed > 0 {
            debug!("Re-keyed {} queued actions {}:{} -> {}", changed, entity_type, old_id, new_id);
            self.persist().await?;
        }
        Ok(changed)
    }

    /// Time until the earliest future retry, if any action is waiting on one
    pub fn next_due_in(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .filter_map(|a| a.next_attempt_at)
            .filter(|at| *at > now)
            .min()
            .and_then(|at| (at - now).to_std().ok())
    }

    /// Run one drain pass, handing each due action to `send` in FIFO order
    pub async fn drain<F, Fut>(&self, mut send: F) -> DrainReport
    where
        F: FnMut(QueuedAction) -> Fut,
        Fut: Future<Output = Result<(), SendFailure>>,
    {
        let Ok(_guard) = self.drain_gate.try_lock() else {
            debug!("Drain already in progress, skipping");
            return DrainReport {
                skipped: true,
                ..Default::default()
            };
        };

        let ids: Vec<String> = self.lock().iter().map(|a| a.id.clone()).collect();
        let mut report = DrainReport::default();
        let mut blocked: HashSet<EntityKey> = HashSet::new();

        for id in ids {
            // Re-read: a rollback may have discarded it or a confirm re-keyed it
            let Some(action) = self.find(&id) else {
                continue;
            };
            let key = action.entity_key();
            if blocked.contains(&key) || !action.is_due(self.clock.now()) {
                blocked.insert(key);
                report.deferred += 1;
                continue;
            }

            match send(action.clone()).await {
                Ok(()) => {
                    if let Err(e) = self.remove(&id).await {
                        warn!("Sent action {} is still stored: {}", id, e);
                        report.paused = Some(format!("queue could not be saved: {}", e));
                        break;
                    }
                    report.sent.push(id);
                }
                Err(SendFailure::Paused(reason)) => {
                    info!("Drain paused: {}", reason);
                    report.paused = Some(reason);
                    break;
                }
                Err(SendFailure::Retryable(reason)) => {
                    blocked.insert(key);
                    match self.record_retry(&id) {
                        RetryOutcome::Scheduled(delay) => {
                            debug!("Action {} failed ({}), retrying in {:?}", id, reason, delay);
                            self.persist_logged().await;
                            report.rescheduled.push(id);
                        }
                        RetryOutcome::Exhausted(action) => {
                            let reason = format!(
                                "gave up after {} attempts: {}",
                                action.retry_count, reason
                            );
                            if let Err(e) = self.drop_action(action, reason, &mut report).await {
                                report.paused = Some(format!("queue could not be saved: {}", e));
                                break;
                            }
                        }
                        RetryOutcome::Gone => {}
                    }
                }
                Err(SendFailure::Fatal(reason)) => {
                    blocked.insert(key);
                    if let Err(e) = self.drop_action(action, reason, &mut report).await {
                        report.paused = Some(format!("queue could not be saved: {}", e));
                        break;
                    }
                }
            }
        }

        report.next_retry_in = self.next_due_in();
        debug!(
            "Drain finished: {} sent, {} rescheduled, {} dropped, {} deferred",
            report.sent.len(),
            report.rescheduled.len(),
            report.dropped.len(),
            report.deferred
        );
        report
    }

    fn record_retry(&self, id: &str) -> RetryOutcome {
        let now = self.clock.now();
        let mut actions = self.lock();
        let Some(action) = actions.iter_mut().find(|a| a.id == id) else {
            return RetryOutcome::Gone;
        };

        action.retry_count += 1;
        if action.is_exhausted() {
            return RetryOutcome::Exhausted(action.clone());
        }

        let delay = self.settings.backoff.delay(action.retry_count - 1);
        action.next_attempt_at = Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
        RetryOutcome::Scheduled(delay)
    }

    async fn drop_action(
        &self,
        action: QueuedAction,
        reason: String,
        report: &mut DrainReport,
    ) -> StorageResult<()> {
        warn!(
            "Dropping {} action {} for {}: {}",
            action.kind,
            action.id,
            action.entity_key(),
            reason
        );
        if let Err(e) = self.remove(&action.id).await {
            warn!("Action {} kept, removal could not be saved: {}", action.id, e);
            return Err(e);
        }
        self.notifier.notify(Notification::SyncFailed {
            action_id: action.id.clone(),
            entity: action.entity_key(),
            reason: reason.clone(),
        });
        report.dropped.push(DroppedAction { action, reason });
        Ok(())
    }

    /// Take an action out; it goes back in place if the write fails
    async fn remove(&self, id: &str) -> StorageResult<()> {
        let (index, action) = {
            let mut actions = self.lock();
            let Some(index) = actions.iter().position(|a| a.id == id) else {
                return Ok(());
            };
            (index, actions.remove(index))
        };

        if let Err(e) = self.persist().await {
            let mut actions = self.lock();
            let index = index.min(actions.len());
            actions.insert(index, action);
            return Err(e);
        }
        self.publish_size();
        Ok(())
    }

    fn find(&self, id: &str) -> Option<QueuedAction> {
        self.lock().iter().find(|a| a.id == id).cloned()
    }

    /// Write the current list; the gate keeps a stale snapshot from landing last
    async fn persist(&self) -> StorageResult<()> {
        let _gate = self.persist_gate.lock().await;
        let value = serde_json::to_value(self.snapshot())?;
        self.store.set(QUEUE_NAMESPACE, PENDING_KEY, value).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!("Failed to persist action queue: {}", e);
        }
    }

    fn publish_size(&self) {
        let size = self.size();
        self.size_tx.send_if_modified(|current| {
            let changed = *current != size;
            *current = size;
            changed
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedAction>> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryStore, NamespaceTxn, Transaction};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        notifier: Notifier,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::new(Utc::now())),
                notifier: Notifier::default(),
            }
        }

        async fn queue(&self) -> ActionQueue {
            ActionQueue::load(
                self.store.clone(),
                self.clock.clone(),
                self.notifier.clone(),
                QueueSettings::default(),
            )
            .await
            .unwrap()
        }
    }

    fn task(id: &str) -> EntityKey {
        EntityKey::new("task", id)
    }

    async fn enqueue(queue: &ActionQueue, kind: ActionKind, id: &str) -> String {
        let action = queue.new_action(kind, &task(id), json!({"title": id}));
        queue.enqueue(action).await.unwrap()
    }

    #[tokio::test]
    async fn test_actions_survive_restart_in_order() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        let first = enqueue(&queue, ActionKind::Create, "a").await;
        let second = enqueue(&queue, ActionKind::Update, "b").await;
        let third = enqueue(&queue, ActionKind::Delete, "c").await;

        // Give one a retry count so we can check it is preserved
        queue.drain(|action| {
            let fail = action.id == first;
            async move {
                if fail {
                    Err(SendFailure::Retryable("503".to_string()))
                } else {
                    Err(SendFailure::Paused("stop".to_string()))
                }
            }
        })
        .await;
        drop(queue);

        let restarted = fixture.queue().await;
        let ids: Vec<_> = restarted.snapshot().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec![first, second, third]);
        assert_eq!(restarted.snapshot()[0].retry_count, 1);
        assert_eq!(restarted.snapshot()[1].retry_count, 0);
    }

    #[tokio::test]
    async fn test_eviction_boundary() {
        let fixture = Fixture::new();
        let horizon = QueueSettings::default().eviction_horizon;
        let queue = fixture.queue().await;
        enqueue(&queue, ActionKind::Create, "old").await;
        drop(queue);

        let start = fixture.clock.now();
        fixture.clock.set(start + horizon - chrono::Duration::seconds(1));
        assert_eq!(fixture.queue().await.size(), 1);

        fixture.clock.set(start + horizon + chrono::Duration::seconds(1));
        assert_eq!(fixture.queue().await.size(), 0);

        // The purge was persisted
        fixture.clock.set(start);
        assert_eq!(fixture.queue().await.size(), 0);
    }

    #[tokio::test]
    async fn test_drain_sends_in_fifo_order() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        let mut expected = Vec::new();
        for id in ["a", "b", "c"] {
            expected.push(enqueue(&queue, ActionKind::Create, id).await);
        }
        let size = queue.watch_size();
        assert_eq!(*size.borrow(), 3);

        let order = Mutex::new(Vec::new());
        let report = queue
            .drain(|action| {
                order.lock().unwrap().push(action.id.clone());
                async { Ok(()) }
            })
            .await;

        assert_eq!(*order.lock().unwrap(), expected);
        assert_eq!(report.sent, expected);
        assert_eq!(queue.size(), 0);
        assert_eq!(*size.borrow(), 0);
        assert!(fixture.store.get(QUEUE_NAMESPACE, PENDING_KEY).await.unwrap() == Some(json!([])));
    }

    #[tokio::test]
    async fn test_retryable_uses_backoff_schedule() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        let id = enqueue(&queue, ActionKind::Update, "a").await;

        let report = queue
            .drain(|_| async { Err(SendFailure::Retryable("429".to_string())) })
            .await;
        assert_eq!(report.rescheduled, vec![id.clone()]);
        assert_eq!(report.next_retry_in, Some(Duration::from_secs(1)));
        assert_eq!(queue.snapshot()[0].retry_count, 1);

        // Not due yet: left alone
        let report = queue.drain(|_| async { Ok(()) }).await;
        assert!(report.sent.is_empty());
        assert_eq!(report.deferred, 1);

        fixture.clock.advance(chrono::Duration::seconds(1));
        queue
            .drain(|_| async { Err(SendFailure::Retryable("503".to_string())) })
            .await;
        assert_eq!(queue.next_due_in(), Some(Duration::from_secs(2)));

        fixture.clock.advance(chrono::Duration::seconds(2));
        let report = queue.drain(|_| async { Ok(()) }).await;
        assert_eq!(report.sent, vec![id]);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_action_is_dropped_and_reported() {
        let fixture = Fixture::new();
        let mut notifications = fixture.notifier.subscribe();
        let queue = fixture.queue().await;
        let id = enqueue(&queue, ActionKind::Create, "a").await;

        for _ in 0..DEFAULT_MAX_RETRIES {
            fixture.clock.advance(chrono::Duration::minutes(1));
            queue
                .drain(|_| async { Err(SendFailure::Retryable("offline".to_string())) })
                .await;
        }

        assert_eq!(queue.size(), 0);
        match notifications.try_recv().unwrap() {
            Notification::SyncFailed { action_id, entity, .. } => {
                assert_eq!(action_id, id);
                assert_eq!(entity, task("a"));
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_drops_immediately() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        enqueue(&queue, ActionKind::Create, "a").await;

        let report = queue
            .drain(|_| async { Err(SendFailure::Fatal("422 invalid".to_string())) })
            .await;

        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].reason, "422 invalid");
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_paused_keeps_action_untouched() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        enqueue(&queue, ActionKind::Create, "a").await;
        enqueue(&queue, ActionKind::Create, "b").await;

        let calls = AtomicUsize::new(0);
        let report = queue
            .drain(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SendFailure::Paused("session expired".to_string())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.paused.as_deref(), Some("session expired"));
        assert_eq!(queue.size(), 2);
        assert!(queue.snapshot().iter().all(|a| a.retry_count == 0));
    }

    #[tokio::test]
    async fn test_later_action_waits_for_same_entity() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        let create = enqueue(&queue, ActionKind::Create, "a").await;
        enqueue(&queue, ActionKind::Update, "a").await;
        let other = enqueue(&queue, ActionKind::Create, "b").await;

        let sent = Mutex::new(Vec::new());
        let report = queue
            .drain(|action| {
                sent.lock().unwrap().push(action.id.clone());
                let fail = action.id == create;
                async move {
                    if fail {
                        Err(SendFailure::Retryable("timeout".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(*sent.lock().unwrap(), vec![create, other]);
        assert_eq!(report.deferred, 1);
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let fixture = Fixture::new();
        let queue = Arc::new(fixture.queue().await);
        enqueue(&queue, ActionKind::Create, "a").await;

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let release = Arc::new(tokio::sync::Notify::new());

        let first = {
            let queue = queue.clone();
            let release = release.clone();
            let mut entered_tx = Some(entered_tx);
            tokio::spawn(async move {
                queue
                    .drain(move |_| {
                        if let Some(tx) = entered_tx.take() {
                            let _ = tx.send(());
                        }
                        let release = release.clone();
                        async move {
                            release.notified().await;
                            Ok(())
                        }
                    })
                    .await
            })
        };

        entered_rx.await.unwrap();
        let second = queue.drain(|_| async { Ok(()) }).await;
        assert!(second.skipped);

        release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.sent.len(), 1);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_discard_and_rekey() {
        let fixture = Fixture::new();
        let queue = fixture.queue().await;
        let create = enqueue(&queue, ActionKind::Create, "task-1").await;
        enqueue(&queue, ActionKind::Update, "task-1").await;

        assert_eq!(queue.rekey_entity("task", "task-1", "task-42").await.unwrap(), 2);
        assert!(queue.snapshot().iter().all(|a| a.entity_id == "task-42"));

        assert_eq!(queue.discard(&[create]).await.unwrap(), 1);
        assert_eq!(queue.size(), 1);

        queue.clear().await.unwrap();
        assert_eq!(queue.size(), 0);
        assert_eq!(fixture.queue().await.size(), 0);
    }

    /// Accepts reads, refuses every write
    struct FullStore;

    #[async_trait]
    impl DurableStore for FullStore {
        async fn get(&self, _: &str, _: &str) -> StorageResult<Option<Value>> {
            Ok(None)
        }
        async fn set(&self, namespace: &str, _: &str, _: Value) -> StorageResult<()> {
            Err(StorageError::StorageFull {
                namespace: namespace.to_string(),
                details: "quota exceeded".to_string(),
            })
        }
        async fn delete(&self, _: &str, _: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn clear(&self, _: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn keys(&self, _: &str) -> StorageResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl TransactionalStore for FullStore {
        async fn run_in_transaction(&self, _: &str, txn: Transaction) -> StorageResult<()> {
            struct Noop;
            impl NamespaceTxn for Noop {
                fn get(&self, _: &str) -> StorageResult<Option<Value>> {
                    Ok(None)
                }
                fn set(&mut self, _: &str, _: Value) -> StorageResult<()> {
                    Ok(())
                }
                fn delete(&mut self, _: &str) -> StorageResult<()> {
                    Ok(())
                }
            }
            txn(&mut Noop)
        }
    }

    #[tokio::test]
    async fn test_enqueue_storage_full_leaves_queue_unchanged() {
        let queue = ActionQueue::load(
            Arc::new(FullStore),
            Arc::new(ManualClock::default()),
            Notifier::default(),
            QueueSettings::default(),
        )
        .await
        .unwrap();

        let action = queue.new_action(ActionKind::Create, &task("a"), json!({}));
        let err = queue.enqueue(action).await.unwrap_err();

        assert!(err.is_storage_full());
        assert_eq!(queue.size(), 0);
    }

    /// In-memory store whose writes can be switched off
    struct SwitchableStore {
        inner: MemoryStore,
        writable: std::sync::atomic::AtomicBool,
    }

    impl SwitchableStore {
        fn check(&self, namespace: &str) -> StorageResult<()> {
            if self.writable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StorageError::StorageFull {
                    namespace: namespace.to_string(),
                    details: "quota exceeded".to_string(),
                })
            }
        }
    }

    #[async_trait]
    impl DurableStore for SwitchableStore {
        async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Value>> {
            self.inner.get(namespace, key).await
        }
        async fn set(&self, namespace: &str, key: &str, value: Value) -> StorageResult<()> {
            self.check(namespace)?;
            self.inner.set(namespace, key, value).await
        }
        async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
            self.check(namespace)?;
            self.inner.delete(namespace, key).await
        }
        async fn clear(&self, namespace: &str) -> StorageResult<()> {
            self.check(namespace)?;
            self.inner.clear(namespace).await
        }
        async fn keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
            self.inner.keys(namespace).await
        }
    }

    #[async_trait]
    impl TransactionalStore for SwitchableStore {
        async fn run_in_transaction(&self, namespace: &str, txn: Transaction) -> StorageResult<()> {
            self.check(namespace)?;
            self.inner.run_in_transaction(namespace, txn).await
        }
    }

    #[tokio::test]
    async fn test_sent_action_kept_when_removal_cannot_be_saved() {
        let store = Arc::new(SwitchableStore {
            inner: MemoryStore::new(),
            writable: std::sync::atomic::AtomicBool::new(true),
        });
        let load = || {
            ActionQueue::load(
                store.clone(),
                Arc::new(ManualClock::default()),
                Notifier::default(),
                QueueSettings::default(),
            )
        };
        let queue = load().await.unwrap();
        let first = enqueue(&queue, ActionKind::Create, "a").await;
        let second = enqueue(&queue, ActionKind::Create, "b").await;

        store.writable.store(false, Ordering::SeqCst);
        let report = queue.drain(|_| async { Ok(()) }).await;

        assert!(report.sent.is_empty());
        assert!(report.paused.is_some());
        let ids: Vec<_> = queue.snapshot().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec![first.clone(), second.clone()]);
        assert_eq!(load().await.unwrap().size(), 2);

        store.writable.store(true, Ordering::SeqCst);
        let report = queue.drain(|_| async { Ok(()) }).await;
        assert_eq!(report.sent, vec![first, second]);
        assert_eq!(load().await.unwrap().size(), 0);
    }
}
