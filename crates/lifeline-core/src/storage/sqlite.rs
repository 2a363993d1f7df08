//! Transactional SQLite store
//!
//! Holds the larger structured collections: the action queue and the
//! per-entity snapshots. All namespaces share the `kv` table.
//!
//! The connection is opened in WAL mode with `synchronous = FULL`, so a
//! committed write survives a crash. Blocking SQLite calls run on tokio's
//! blocking pool; callers never stall the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::schema::{init_schema, needs_init};
use super::{
    validate_name, DurableStore, NamespaceTxn, StorageError, StorageResult, Transaction,
    TransactionalStore,
};

/// SQLite-backed implementation of [`TransactionalStore`]
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf(), "database"))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Cap the database size in pages; writes beyond it fail with `StorageFull`
    pub fn with_page_quota(self, max_pages: u64) -> StorageResult<Self> {
        {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            // The pragma echoes the effective limit back as a row.
            let _: i64 = conn.query_row(
                &format!("PRAGMA max_page_count = {}", max_pages),
                [],
                |row| row.get(0),
            )?;
        }
        Ok(self)
    }

    /// Run `op` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| poisoned())?;
            op(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn poisoned() -> StorageError {
    StorageError::Task("connection lock poisoned".to_string())
}

fn decode(namespace: &str, key: &str, text: &str) -> StorageResult<Value> {
    serde_json::from_str(text).map_err(|e| StorageError::CorruptValue {
        namespace: namespace.to_string(),
        key: key.to_string(),
        details: e.to_string(),
    })
}

fn read_value(conn: &Connection, namespace: &str, key: &str) -> StorageResult<Option<Value>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StorageError::from_sqlite(e, namespace))?;

    text.map(|t| decode(namespace, key, &t)).transpose()
}

fn write_value(conn: &Connection, namespace: &str, key: &str, value: &Value) -> StorageResult<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![namespace, key, text, chrono::Utc::now().timestamp_millis()],
    )
    .map_err(|e| StorageError::from_sqlite(e, namespace))?;
    Ok(())
}

fn delete_value(conn: &Connection, namespace: &str, key: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
        params![namespace, key],
    )
    .map_err(|e| StorageError::from_sqlite(e, namespace))?;
    Ok(())
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Value>> {
        validate_name(namespace)?;
        let (ns, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| read_value(conn, &ns, &key)).await
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> StorageResult<()> {
        validate_name(namespace)?;
        let (ns, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| write_value(conn, &ns, &key, &value))
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        validate_name(namespace)?;
        let (ns, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| delete_value(conn, &ns, &key)).await
    }

    async fn clear(&self, namespace: &str) -> StorageResult<()> {
        validate_name(namespace)?;
        let ns = namespace.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE namespace = ?1", params![ns])
                .map_err(|e| StorageError::from_sqlite(e, &ns))?;
            Ok(())
        })
        .await
    }

    async fn keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_name(namespace)?;
        let ns = namespace.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv WHERE namespace = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![ns], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

/// Namespace view over an open SQLite transaction
struct SqliteTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    namespace: &'a str,
}

impl NamespaceTxn for SqliteTxn<'_> {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        read_value(self.tx, self.namespace, key)
    }

    fn set(&mut self, key: &str, value: Value) -> StorageResult<()> {
        write_value(self.tx, self.namespace, key, &value)
    }

    fn delete(&mut self, key: &str) -> StorageResult<()> {
        delete_value(self.tx, self.namespace, key)
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn run_in_transaction(&self, namespace: &str, txn: Transaction) -> StorageResult<()> {
        validate_name(namespace)?;
        let ns = namespace.to_string();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StorageError::from_sqlite(e, &ns))?;
            {
                let mut view = SqliteTxn {
                    tx: &tx,
                    namespace: &ns,
                };
                // Dropping `tx` without commit rolls everything back.
                txn(&mut view)?;
            }
            tx.commit().map_err(|e| StorageError::from_sqlite(e, &ns))
        })
        .await
    }
}
