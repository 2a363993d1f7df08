//! Optimistic mutation engine
//!
//! Local edits show up in the [`EntityCache`] immediately and are queued for
//! transmission. Consecutive edits to one entity form a chain that shares a
//! single rollback point: the value before the *first* edit. The chain ends
//! when its last queued action is confirmed (server value merged in) or when
//! any of its actions fails for good (rollback point restored).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{EntityCache, EntityKey};
use crate::clock::Clock;
use crate::notify::{Notification, Notifier};
use crate::queue::{ActionKind, ActionQueue, QueuedAction};
use crate::storage::StorageResult;

/// Rollback point for an entity with unconfirmed local edits
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOptimisticEdit {
    pub entity_key: EntityKey,
    /// Value before the first edit of the chain; `None` if it did not exist
    pub previous_snapshot: Option<Value>,
    pub applied_at: DateTime<Utc>,
    /// Queued actions of this chain that the server has not confirmed yet
    pub outstanding: Vec<String>,
}

pub struct OptimisticEngine {
    cache: Arc<EntityCache>,
    queue: Arc<ActionQueue>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<EntityKey, PendingOptimisticEdit>>,
}

impl OptimisticEngine {
    pub fn new(
        cache: Arc<EntityCache>,
        queue: Arc<ActionQueue>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            queue,
            notifier,
            clock,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Apply a local edit and queue it for the server
    ///
    /// `mutator` receives the current cached value and returns the new one
    /// (`None` removes the entity). `payload` is what gets transmitted.
    pub async fn apply<F>(
        &self,
        kind: ActionKind,
        key: &EntityKey,
        payload: Value,
        mutator: F,
    ) -> StorageResult<QueuedAction>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let current = self.cache.get(key);
        let next = mutator(current.as_ref());
        let action = self.queue.new_action(kind, key, payload);

        let started_chain = {
            let mut pending = self.lock();
            match pending.get_mut(key) {
                Some(edit) => {
                    edit.outstanding.push(action.id.clone());
                    false
                }
                None => {
                    pending.insert(
                        key.clone(),
                        PendingOptimisticEdit {
                            entity_key: key.clone(),
                            previous_snapshot: current.clone(),
                            applied_at: self.clock.now(),
                            outstanding: vec![action.id.clone()],
                        },
                    );
                    true
                }
            }
        };

        if let Err(e) = self.cache.set(key, next).await {
            self.forget(key, &action.id, started_chain);
            return Err(e);
        }

        if let Err(e) = self.queue.enqueue(action.clone()).await {
            self.forget(key, &action.id, started_chain);
            // Undo just this edit; earlier edits in the chain stay visible
            self.cache.set(key, current).await?;
            return Err(e);
        }

        debug!("Applied optimistic {} to {}", kind, key);
        Ok(action)
    }

    /// The server accepted `action`; `server_body` is its response, if any
    ///
    /// Returns the entity's key afterwards, which differs from the action's
    /// when the server assigned a new id.
    pub async fn confirm(&self, action: &QueuedAction, server_body: Option<&Value>) -> StorageResult<EntityKey> {
        let key = action.entity_key();
        let server_id = if action.kind == ActionKind::Create {
            server_body.and_then(assigned_id).filter(|id| *id != key.id)
        } else {
            None
        };

        // Decide under the lock, act after releasing it
        let finished = {
            let mut pending = self.lock();
            match pending.get_mut(&key) {
                Some(edit) => {
                    edit.outstanding.retain(|id| *id != action.id);
                    if edit.outstanding.is_empty() {
                        pending.remove(&key);
                        true
                    } else {
                        if action.kind == ActionKind::Delete {
                            edit.previous_snapshot = None;
                        } else if let Some(body) = server_body.filter(|b| !b.is_null()) {
                            edit.previous_snapshot =
                                Some(merge_server(edit.previous_snapshot.as_ref(), body));
                        }
                        false
                    }
                }
                None => true,
            }
        };

        let final_key = match &server_id {
            Some(id) => key.with_id(id.clone()),
            None => key.clone(),
        };

        if finished {
            let value = match action.kind {
                ActionKind::Delete => None,
                _ => {
                    let local = self.cache.get(&key);
                    match server_body.filter(|b| !b.is_null()) {
                        Some(body) => Some(merge_server(local.as_ref(), body)),
                        None => local,
                    }
                }
            };

            match (&server_id, value) {
                (Some(_), Some(value)) => self.cache.rekey(&key, &final_key, value).await?,
                (_, value) => self.cache.set(&key, value).await?,
            }
        } else if let (Some(new_id), Some(mut value)) = (&server_id, self.cache.get(&key)) {
            // Still editing: move the visible value, keep the local fields
            if let Some(id) = value.as_object_mut().and_then(|fields| fields.get_mut("id")) {
                *id = Value::String(new_id.clone());
            }
            self.cache.rekey(&key, &final_key, value).await?;
        }

        if let Some(new_id) = &server_id {
            self.queue.rekey_entity(&key.entity_type, &key.id, new_id).await?;
            let mut pending = self.lock();
            if let Some(mut edit) = pending.remove(&key) {
                edit.entity_key = final_key.clone();
                pending.insert(final_key.clone(), edit);
            }
            info!("Server assigned {} to {}", final_key, key);
        }

        debug!("Confirmed {} for {}", action.id, final_key);
        Ok(final_key)
    }

    /// Restore the rollback point of the chain `action` belongs to
    ///
    /// Returns `false` when there was nothing to roll back, so calling it twice
    /// is harmless.
    pub async fn rollback(&self, action: &QueuedAction, reason: &str) -> StorageResult<bool> {
        let key = action.entity_key();
        let edit = {
            let mut pending = self.lock();
            let belongs = pending
                .get(&key)
                .is_some_and(|edit| edit.outstanding.contains(&action.id));
            if !belongs {
                return Ok(false);
            }
            pending.remove(&key)
        };
        let Some(edit) = edit else {
            return Ok(false);
        };

        self.cache.set(&key, edit.previous_snapshot.clone()).await?;

        let others: Vec<String> = edit
            .outstanding
            .iter()
            .filter(|id| **id != action.id)
            .cloned()
            .collect();
        if !others.is_empty() {
            self.queue.discard(&others).await?;
        }

        info!("Rolled back {} ({})", key, reason);
        self.notifier.notify(Notification::ChangeNotSaved {
            entity: key,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Apply a server-pushed value (`None` = deleted on the server)
    ///
    /// Pushed fields are merged over the known value, server wins. While a
    /// local edit is pending the local value stays visible and the merged
    /// server value becomes the rollback point instead.
    pub async fn reconcile_remote(&self, key: &EntityKey, value: Option<Value>) -> StorageResult<()> {
        {
            let mut pending = self.lock();
            if let Some(edit) = pending.get_mut(key) {
                debug!("Deferring remote update for {}: local edit pending", key);
                edit.previous_snapshot = value.map(|v| merge_server(edit.previous_snapshot.as_ref(), &v));
                return Ok(());
            }
        }
        let merged = value.map(|v| merge_server(self.cache.get(key).as_ref(), &v));
        self.cache.set(key, merged).await
    }

    pub fn pending_edit(&self, key: &EntityKey) -> Option<PendingOptimisticEdit> {
        self.lock().get(key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Undo the bookkeeping for an edit that never made it into the queue
    fn forget(&self, key: &EntityKey, action_id: &str, started_chain: bool) {
        let mut pending = self.lock();
        if started_chain {
            pending.remove(key);
        } else if let Some(edit) = pending.get_mut(key) {
            edit.outstanding.retain(|id| id != action_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityKey, PendingOptimisticEdit>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Id the server assigned in a create response
fn assigned_id(body: &Value) -> Option<String> {
    match body.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Field-level merge where the server wins
pub fn merge_server(local: Option<&Value>, server: &Value) -> Value {
    match (local, server) {
        (Some(Value::Object(local)), Value::Object(server)) => {
            let mut merged = local.clone();
            for (field, value) in server {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => server.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::{QueueSettings, SendFailure};
    use crate::storage::MemoryStore;
    use serde_json::json;

    struct Harness {
        engine: OptimisticEngine,
        queue: Arc<ActionQueue>,
        notifications: tokio::sync::broadcast::Receiver<Notification>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let notifier = Notifier::default();
        let notifications = notifier.subscribe();
        let queue = Arc::new(
            ActionQueue::load(store.clone(), clock.clone(), notifier.clone(), QueueSettings::default())
                .await
                .unwrap(),
        );
        let cache = Arc::new(EntityCache::new(store));
        Harness {
            engine: OptimisticEngine::new(cache, queue.clone(), notifier, clock),
            queue,
            notifications,
        }
    }

    fn set_to(value: Value) -> impl FnOnce(Option<&Value>) -> Option<Value> {
        move |_| Some(value)
    }

    #[tokio::test]
    async fn test_apply_updates_cache_and_queues() {
        let h = harness().await;
        let key = EntityKey::new("task", "task-1");

        let action = h
            .engine
            .apply(ActionKind::Create, &key, json!({"title": "Run"}), set_to(json!({"title": "Run"})))
            .await
            .unwrap();

        assert_eq!(h.engine.cache().get(&key), Some(json!({"title": "Run"})));
        assert_eq!(h.queue.size(), 1);
        let edit = h.engine.pending_edit(&key).unwrap();
        assert_eq!(edit.previous_snapshot, None);
        assert_eq!(edit.outstanding, vec![action.id]);
    }

    #[tokio::test]
    async fn test_rollback_restores_first_snapshot() {
        let mut h = harness().await;
        let key = EntityKey::new("task", "t1");
        h.engine.cache().put(&key, json!({"title": "original"})).await.unwrap();

        let first = h
            .engine
            .apply(ActionKind::Update, &key, json!({}), set_to(json!({"title": "edit 1"})))
            .await
            .unwrap();
        h.engine
            .apply(ActionKind::Update, &key, json!({}), set_to(json!({"title": "edit 2"})))
            .await
            .unwrap();

        assert!(h.engine.rollback(&first, "422").await.unwrap());
        assert_eq!(h.engine.cache().get(&key), Some(json!({"title": "original"})));
        // The second edit of the chain no longer waits in the queue
        assert_eq!(h.queue.size(), 1);
        assert!(h.queue.snapshot().iter().all(|a| a.id == first.id));

        // Rolling back again changes nothing
        assert!(!h.engine.rollback(&first, "422").await.unwrap());
        assert_eq!(h.engine.cache().get(&key), Some(json!({"title": "original"})));

        assert!(matches!(
            h.notifications.try_recv().unwrap(),
            Notification::ChangeNotSaved { .. }
        ));
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rollback_of_create_removes_entity() {
        let h = harness().await;
        let key = EntityKey::new("badge", "b1");
        let action = h
            .engine
            .apply(ActionKind::Create, &key, json!({}), set_to(json!({"name": "Early bird"})))
            .await
            .unwrap();

        h.engine.rollback(&action, "fatal").await.unwrap();
        assert_eq!(h.engine.cache().get(&key), None);
        assert!(h.engine.pending_edit(&key).is_none());
    }

    #[tokio::test]
    async fn test_confirm_merges_server_fields() {
        let h = harness().await;
        let key = EntityKey::new("task", "t1");
        let action = h
            .engine
            .apply(
                ActionKind::Update,
                &key,
                json!({}),
                set_to(json!({"title": "draft", "done": false})),
            )
            .await
            .unwrap();

        let server = json!({"title": "Draft", "updatedAt": "2026-01-01T00:00:00Z"});
        h.engine.confirm(&action, Some(&server)).await.unwrap();

        assert_eq!(
            h.engine.cache().get(&key),
            Some(json!({"title": "Draft", "done": false, "updatedAt": "2026-01-01T00:00:00Z"}))
        );
        assert!(h.engine.pending_edit(&key).is_none());
    }

    #[tokio::test]
    async fn test_confirm_with_server_id_rekeys() {
        let h = harness().await;
        let local = EntityKey::new("task", "task-1");
        let create = h
            .engine
            .apply(ActionKind::Create, &local, json!({}), set_to(json!({"title": "Swim"})))
            .await
            .unwrap();
        h.engine
            .apply(ActionKind::Update, &local, json!({}), set_to(json!({"title": "Swim 2k"})))
            .await
            .unwrap();

        let server = json!({"id": "task-42", "title": "Swim"});
        let key = h.engine.confirm(&create, Some(&server)).await.unwrap();
        let remote = EntityKey::new("task", "task-42");

        assert_eq!(key, remote);
        assert_eq!(h.engine.cache().get(&local), None);
        // The later edit is still outstanding, so its value stays visible
        assert_eq!(h.engine.cache().get(&remote), Some(json!({"title": "Swim 2k"})));
        assert!(h.queue.snapshot().iter().all(|a| a.entity_id == "task-42"));

        let edit = h.engine.pending_edit(&remote).unwrap();
        assert_eq!(edit.previous_snapshot, Some(server));
    }

    #[tokio::test]
    async fn test_rollback_after_partial_confirm_restores_server_value() {
        let h = harness().await;
        let key = EntityKey::new("task", "t1");
        let first = h
            .engine
            .apply(ActionKind::Update, &key, json!({}), set_to(json!({"title": "a"})))
            .await
            .unwrap();
        let second = h
            .engine
            .apply(ActionKind::Update, &key, json!({}), set_to(json!({"title": "b"})))
            .await
            .unwrap();

        h.engine.confirm(&first, Some(&json!({"title": "A"}))).await.unwrap();
        assert_eq!(h.engine.cache().get(&key), Some(json!({"title": "b"})));

        h.engine.rollback(&second, "gave up").await.unwrap();
        assert_eq!(h.engine.cache().get(&key), Some(json!({"title": "A"})));
    }

    #[tokio::test]
    async fn test_remote_update_waits_behind_local_edit() {
        let h = harness().await;
        let key = EntityKey::new("health", "h1");
        h.engine.reconcile_remote(&key, Some(json!({"steps": 1}))).await.unwrap();
        assert_eq!(h.engine.cache().get(&key), Some(json!({"steps": 1})));

        let action = h
            .engine
            .apply(ActionKind::Update, &key, json!({}), set_to(json!({"steps": 5})))
            .await
            .unwrap();
        h.engine.reconcile_remote(&key, Some(json!({"steps": 3}))).await.unwrap();

        assert_eq!(h.engine.cache().get(&key), Some(json!({"steps": 5})));
        h.engine.rollback(&action, "fatal").await.unwrap();
        assert_eq!(h.engine.cache().get(&key), Some(json!({"steps": 3})));
    }

    #[tokio::test]
    async fn test_drain_failure_then_rollback() {
        let h = harness().await;
        let key = EntityKey::new("task", "t9");
        h.engine.cache().put(&key, json!({"title": "keep me"})).await.unwrap();
        h.engine
            .apply(ActionKind::Delete, &key, Value::Null, |_| None)
            .await
            .unwrap();
        assert_eq!(h.engine.cache().get(&key), None);

        let report = h
            .queue
            .drain(|_| async { Err(SendFailure::Fatal("403".to_string())) })
            .await;
        for dropped in &report.dropped {
            h.engine.rollback(&dropped.action, &dropped.reason).await.unwrap();
        }

        assert_eq!(report.dropped.len(), 1);
        assert_eq!(h.engine.cache().get(&key), Some(json!({"title": "keep me"})));
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[test]
    fn test_merge_server_prefers_server_fields() {
        let merged = merge_server(Some(&json!({"a": 1, "b": 2})), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(merge_server(None, &json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_server(Some(&json!({"a": 1})), &json!(7)), json!(7));
    }
}
