//! Durable storage adapters
//!
//! A uniform async key-value interface over persistent media.
//!
//! ## Adapters
//!
//! - **FileStore**: one JSON file per key, for small scalar state (credentials)
//! - **SqliteStore**: transactional store for structured collections
//!   (action queue, entity snapshots)
//! - **MemoryStore**: non-durable stand-in for tests and ephemeral sessions
//!
//! ## Layout
//!
//! Every value lives in a namespace: `auth`, `action_queue`, and one
//! `entities.<type>` namespace per entity collection.

pub mod error;
pub mod file;
pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Namespace holding the credential set
pub const AUTH_NAMESPACE: &str = "auth";

/// Namespace holding the global action queue
pub const QUEUE_NAMESPACE: &str = "action_queue";

/// Namespace for one entity collection
pub fn entity_namespace(entity_type: &str) -> String {
    format!("entities.{}", entity_type)
}

/// Async key-value storage
///
/// Writes are durable before the returned future resolves with `Ok`.
/// Capacity problems surface as [`StorageError::StorageFull`].
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Value>>;

    async fn set(&self, namespace: &str, key: &str, value: Value) -> StorageResult<()>;

    /// Remove a key; removing a missing key is not an error
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()>;

    /// Remove every key in a namespace
    async fn clear(&self, namespace: &str) -> StorageResult<()>;

    /// All keys currently stored in a namespace, sorted
    async fn keys(&self, namespace: &str) -> StorageResult<Vec<String>>;
}

/// Read-modify-write access to one namespace inside a transaction
pub trait NamespaceTxn {
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;
    fn set(&mut self, key: &str, value: Value) -> StorageResult<()>;
    fn delete(&mut self, key: &str) -> StorageResult<()>;
}

/// Work to run atomically against one namespace
pub type Transaction = Box<dyn FnOnce(&mut dyn NamespaceTxn) -> StorageResult<()> + Send + 'static>;

/// Store that can apply several operations atomically
#[async_trait]
pub trait TransactionalStore: DurableStore {
    /// Run `txn` against `namespace`; either every write lands or none does
    async fn run_in_transaction(&self, namespace: &str, txn: Transaction) -> StorageResult<()>;
}

/// Reject names that cannot be mapped safely onto every adapter
pub(crate) fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('\0') || name.contains('/') || name.contains('\\') {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    Ok(())
}
