//! File-per-key store for small scalar state
//!
//! Layout: `<root>/<namespace>/<key>.json`. Every write goes through an
//! atomic temp-file + fsync + rename so a crash never leaves a torn value.
//!
//! An optional byte quota emulates constrained platform storage; a write that
//! would push the total over the quota fails with `StorageFull`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{validate_name, DurableStore, StorageError, StorageResult};

/// Simple durable store backed by JSON files
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileStore {
    /// Create a store rooted at `root` (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
        }
    }

    /// Limit the total size of all stored values
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> StorageResult<PathBuf> {
        validate_name(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn key_path(&self, namespace: &str, key: &str) -> StorageResult<PathBuf> {
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{}.json", encode_key(key))))
    }

    async fn blocking<T, F>(op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StorageResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Value>> {
        let path = self.key_path(namespace, key)?;
        let (ns, key) = (namespace.to_string(), key.to_string());
        Self::blocking(move || {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(StorageError::ReadError { path, source }),
            };
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::CorruptValue {
                    namespace: ns,
                    key,
                    details: e.to_string(),
                })
        })
        .await
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> StorageResult<()> {
        let path = self.key_path(namespace, key)?;
        let root = self.root.clone();
        let quota = self.quota_bytes;
        let ns = namespace.to_string();
        Self::blocking(move || {
            let bytes = serde_json::to_vec(&value)?;

            if let Some(limit) = quota {
                let existing = file_len(&path);
                let used = dir_size(&root).saturating_sub(existing);
                if used + bytes.len() as u64 > limit {
                    return Err(StorageError::StorageFull {
                        namespace: ns,
                        details: format!(
                            "{} bytes requested, {} of {} bytes in use",
                            bytes.len(),
                            used,
                            limit
                        ),
                    });
                }
            }

            atomic_write(&path, &bytes).map_err(|e| StorageError::from_io(e, path, &ns))
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        let path = self.key_path(namespace, key)?;
        let ns = namespace.to_string();
        Self::blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, path, &ns)),
        })
        .await
    }

    async fn clear(&self, namespace: &str) -> StorageResult<()> {
        let dir = self.namespace_dir(namespace)?;
        let ns = namespace.to_string();
        Self::blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, dir, &ns)),
        })
        .await
    }

    async fn keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let dir = self.namespace_dir(namespace)?;
        Self::blocking(move || {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(source) => return Err(StorageError::ReadError { path: dir, source }),
            };

            let mut keys = Vec::new();
            for entry in entries {
                let name = entry?.file_name();
                let name = name.to_string_lossy();
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Some(key) = decode_key(stem) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                file_len(&path)
            }
        })
        .sum()
}

/// Keys may contain any character; anything outside `[A-Za-z0-9_-]` is
/// written as `%XX` so the file name stays portable.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
