//! Visible entity cache
//!
//! Holds the values the UI renders, keyed by entity type and id. Each write is
//! mirrored into the entity's `entities.<type>` namespace before it becomes
//! visible, then announced to subscribers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::storage::{entity_namespace, DurableStore, StorageResult, TransactionalStore};

/// Identifies one cached entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Same type, different id
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self::new(self.entity_type.clone(), id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Error parsing a `type:id` string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected '<type>:<id>', got '{0}'")]
pub struct EntityKeyParseError(String);

impl FromStr for EntityKey {
    type Err = EntityKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((ty, id)) if !ty.is_empty() && !id.is_empty() => Ok(Self::new(ty, id)),
            _ => Err(EntityKeyParseError(s.to_string())),
        }
    }
}

/// A change to the visible cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    Updated { key: EntityKey, value: Value },
    Removed { key: EntityKey },
    /// The whole collection is stale and should be refetched
    Invalidated { entity_type: String },
}

impl CacheChange {
    pub fn entity_type(&self) -> &str {
        match self {
            CacheChange::Updated { key, .. } | CacheChange::Removed { key } => &key.entity_type,
            CacheChange::Invalidated { entity_type } => entity_type,
        }
    }
}

/// Which changes a subscriber wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheFilter {
    All,
    Type(String),
    Entity(EntityKey),
}

impl CacheFilter {
    pub fn matches(&self, change: &CacheChange) -> bool {
        match self {
            CacheFilter::All => true,
            CacheFilter::Type(ty) => change.entity_type() == ty,
            CacheFilter::Entity(wanted) => match change {
                CacheChange::Updated { key, .. } | CacheChange::Removed { key } => key == wanted,
                CacheChange::Invalidated { entity_type } => *entity_type == wanted.entity_type,
            },
        }
    }
}

/// Filtered stream of cache changes
pub struct CacheSubscription {
    rx: broadcast::Receiver<CacheChange>,
    filter: CacheFilter,
}

impl CacheSubscription {
    /// Next matching change; `None` once the cache is gone
    pub async fn recv(&mut self) -> Option<CacheChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("cache subscriber lagged, {} changes skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching change that is already buffered
    pub fn try_recv(&mut self) -> Option<CacheChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.filter.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Entity values currently shown to the user
pub struct EntityCache {
    entries: RwLock<HashMap<EntityKey, Value>>,
    changes: broadcast::Sender<CacheChange>,
    store: Arc<dyn TransactionalStore>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        let (changes, _rx) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
            store,
        }
    }

    /// Load every persisted entity of one type into memory
    pub async fn hydrate(&self, entity_type: &str) -> StorageResult<usize> {
        let namespace = entity_namespace(entity_type);
        let mut loaded = Vec::new();
        for id in self.store.keys(&namespace).await? {
            if let Some(value) = self.store.get(&namespace, &id).await? {
                loaded.push((EntityKey::new(entity_type, id), value));
            }
        }

        let count = loaded.len();
        self.write_entries().extend(loaded);
        debug!("hydrated {} {} entities", count, entity_type);
        Ok(count)
    }

    pub fn get(&self, key: &EntityKey) -> Option<Value> {
        self.read_entries().get(key).cloned()
    }

    /// All cached entities of one type, ordered by id
    pub fn entries_of(&self, entity_type: &str) -> Vec<(EntityKey, Value)> {
        let mut entries: Vec<_> = self
            .read_entries()
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Store `value`, or remove the entry when `None`
    pub async fn set(&self, key: &EntityKey, value: Option<Value>) -> StorageResult<()> {
        match value {
            Some(value) => self.put(key, value).await,
            None => self.remove(key).await,
        }
    }

    pub async fn put(&self, key: &EntityKey, value: Value) -> StorageResult<()> {
        self.store
            .set(&entity_namespace(&key.entity_type), &key.id, value.clone())
            .await?;
        self.write_entries().insert(key.clone(), value.clone());
        self.publish(CacheChange::Updated {
            key: key.clone(),
            value,
        });
        Ok(())
    }

    pub async fn remove(&self, key: &EntityKey) -> StorageResult<()> {
        self.store
            .delete(&entity_namespace(&key.entity_type), &key.id)
            .await?;
        let existed = self.write_entries().remove(key).is_some();
        if existed {
            self.publish(CacheChange::Removed { key: key.clone() });
        }
        Ok(())
    }

    /// Move an entry to a new key, atomically in storage
    pub async fn rekey(&self, from: &EntityKey, to: &EntityKey, value: Value) -> StorageResult<()> {
        if from.entity_type != to.entity_type {
            self.remove(from).await?;
            return self.put(to, value).await;
        }

        let (old_id, new_id, stored) = (from.id.clone(), to.id.clone(), value.clone());
        self.store
            .run_in_transaction(
                &entity_namespace(&from.entity_type),
                Box::new(move |txn| {
                    txn.delete(&old_id)?;
                    txn.set(&new_id, stored)
                }),
            )
            .await?;

        {
            let mut entries = self.write_entries();
            entries.remove(from);
            entries.insert(to.clone(), value.clone());
        }
        self.publish(CacheChange::Removed { key: from.clone() });
        self.publish(CacheChange::Updated {
            key: to.clone(),
            value,
        });
        Ok(())
    }

    /// Tell subscribers a whole collection must be refetched
    pub fn invalidate(&self, entity_type: &str) {
        self.publish(CacheChange::Invalidated {
            entity_type: entity_type.to_string(),
        });
    }

    pub fn subscribe(&self, filter: CacheFilter) -> CacheSubscription {
        CacheSubscription {
            rx: self.changes.subscribe(),
            filter,
        }
    }

    fn publish(&self, change: CacheChange) {
        let _ = self.changes.send(change);
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EntityKey, Value>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<EntityKey, Value>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
