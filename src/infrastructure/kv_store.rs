//! Durable key/value storage for cache entries and queued mutations.
//!
//! The SQLite backend commits every batch in a single transaction, so a
//! batch of puts and deletes lands entirely or not at all. The memory
//! backend is used when the database cannot be opened and in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{AppError, Result};

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace a key.
    Put { key: String, value: Vec<u8> },
    /// Remove a key if present.
    Delete { key: String },
    /// Remove every key starting with the prefix.
    DeletePrefix { prefix: String },
}

impl WriteOp {
    /// Insert or replace `key`.
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    /// Remove `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Remove every key under `prefix`.
    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Self::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// Persistence API shared by the cache and the mutation queue.
pub trait KeyValueStore: Send + Sync {
    /// Read one key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read every key under `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply all writes atomically.
    fn write_batch(&self, ops: &[WriteOp]) -> Result<()>;

    /// Human readable location for diagnostics.
    fn location(&self) -> String;
}

/// SQLite-backed key/value store.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteKvStore {
    /// Opens or creates the store database.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable = |message: String| AppError::StorageUnavailable {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| unavailable(format!("Failed to create storage directory: {e}")))?;
        }

        let conn = Connection::open(path).map_err(|e| unavailable(e.to_string()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )
        .map_err(|e| unavailable(e.to_string()))?;

        conn.execute_batch(KV_SCHEMA)
            .map_err(|e| unavailable(format!("Failed to create schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }
}

/// Schema for the key/value table.
const KV_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()
        .map_err(AppError::database)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )
            .map_err(AppError::database)?;

        let rows = stmt
            .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(AppError::database)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(AppError::database)
    }

    fn write_batch(&self, ops: &[WriteOp]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::database)?;

        for op in ops {
            let result = match op {
                WriteOp::Put { key, value } => tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value, updated_at)
                     VALUES (?1, ?2, datetime('now'))",
                    params![key, value],
                ),
                WriteOp::Delete { key } => tx.execute("DELETE FROM kv WHERE key = ?1", [key]),
                WriteOp::DeletePrefix { prefix } => tx.execute(
                    "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                    [prefix],
                ),
            };
            result.map_err(AppError::database)?;
        }

        tx.commit().map_err(AppError::database)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory key/value store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: &[WriteOp]) -> Result<()> {
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key } => {
                    entries.remove(key);
                }
                WriteOp::DeletePrefix { prefix } => {
                    entries.retain(|k, _| !k.starts_with(prefix.as_str()));
                }
            }
        }
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
