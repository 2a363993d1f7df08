//! In-memory store
//!
//! Not durable across processes, but an `Arc<MemoryStore>` shared between two
//! component instances behaves like a device that was restarted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    validate_name, DurableStore, NamespaceTxn, StorageError, StorageResult, Transaction,
    TransactionalStore,
};

type Namespaces = HashMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Namespaces>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Namespaces>> {
        self.data
            .lock()
            .map_err(|_| StorageError::Task("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Value>> {
        validate_name(namespace)?;
        Ok(self
            .lock()?
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> StorageResult<()> {
        validate_name(namespace)?;
        self.lock()?
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        validate_name(namespace)?;
        if let Some(ns) = self.lock()?.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> StorageResult<()> {
        validate_name(namespace)?;
        self.lock()?.remove(namespace);
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_name(namespace)?;
        Ok(self
            .lock()?
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Works on a copy of the namespace; the copy replaces the original on success
struct MemoryTxn {
    working: BTreeMap<String, Value>,
}

impl NamespaceTxn for MemoryTxn {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.working.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> StorageResult<()> {
        self.working.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StorageResult<()> {
        self.working.remove(key);
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn run_in_transaction(&self, namespace: &str, txn: Transaction) -> StorageResult<()> {
        validate_name(namespace)?;
        let mut data = self.lock()?;
        let mut view = MemoryTxn {
            working: data.get(namespace).cloned().unwrap_or_default(),
        };
        txn(&mut view)?;
        data.insert(namespace.to_string(), view.working);
        Ok(())
    }
}
