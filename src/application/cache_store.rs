//! Cache store - last-known server data with fetch timestamps.
//!
//! Reads are served from an in-memory mirror; writes are persisted first and
//! then swapped into the mirror under one write lock, so a reader sees
//! either every entry of a batch or none of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::domain::{AppError, CachedData, CachedEntity, Result};
use crate::infrastructure::schema::{decode, encode};
use crate::infrastructure::{Clock, DurableWriter, KeyValueStore, WriteOp};

/// Storage key prefix for cache entries.
const CACHE_PREFIX: &str = "cache/";

fn storage_key(key: &str) -> String {
    format!("{CACHE_PREFIX}{key}")
}

/// Durable key/value cache of server data.
pub struct CacheStore {
    writer: DurableWriter,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    entries: RwLock<BTreeMap<String, CachedEntity<Value>>>,
}

impl CacheStore {
    /// Open the cache, loading every persisted entry.
    ///
    /// Entries that cannot be decoded are skipped with a warning; a store
    /// that cannot be read at all leaves the cache empty and memory-only.
    pub fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        let writer = DurableWriter::new(store, "cache");
        let mut entries = BTreeMap::new();

        match writer.store().scan_prefix(CACHE_PREFIX) {
            Ok(rows) => {
                for (stored_key, bytes) in rows {
                    match decode::<CachedEntity<Value>>(&stored_key, &bytes) {
                        Ok(entry) => {
                            entries.insert(entry.key.clone(), entry);
                        }
                        Err(e) => {
                            tracing::warn!(key = %stored_key, error = %e, "Skipping unreadable cache entry");
                        }
                    }
                }
            }
            Err(e) => writer.degrade(&e.to_string()),
        }

        tracing::debug!(entries = entries.len(), "Cache loaded");

        Self {
            writer,
            clock,
            stale_after,
            entries: RwLock::new(entries),
        }
    }

    /// Raw entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedEntity<Value>> {
        self.entries.read().get(key).cloned()
    }

    /// Entry for `key` deserialized as `T`.
    ///
    /// # Errors
    /// Returns `JsonParse` if the cached value does not have the shape of `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
        let Some(entry) = self.get(key) else {
            return Ok(None);
        };
        let value = serde_json::from_value(entry.value).map_err(AppError::json_parse)?;
        Ok(Some(CachedEntity::new(entry.key, value, entry.fetched_at)))
    }

    /// Store `value` under `key`, fetched now.
    ///
    /// # Errors
    /// Returns `JsonParse` if `value` cannot be serialized.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(AppError::json_parse)?;
        self.put_many(vec![(key.to_string(), value)], self.clock.now())
    }

    /// Store `value` under `key` with an explicit fetch time.
    ///
    /// # Errors
    /// Returns `JsonParse` if `value` cannot be serialized.
    pub fn put_at<T: Serialize>(&self, key: &str, value: &T, fetched_at: DateTime<Utc>) -> Result<()> {
        let value = serde_json::to_value(value).map_err(AppError::json_parse)?;
        self.put_many(vec![(key.to_string(), value)], fetched_at)
    }

    /// Replace several entries as one unit.
    ///
    /// # Errors
    /// Returns `JsonParse` if an entry cannot be encoded; nothing is written
    /// in that case.
    pub fn put_many(&self, items: Vec<(String, Value)>, fetched_at: DateTime<Utc>) -> Result<()> {
        let entries: Vec<CachedEntity<Value>> = items
            .into_iter()
            .map(|(key, value)| CachedEntity::new(key, value, fetched_at))
            .collect();

        let ops = entries
            .iter()
            .map(|entry| Ok(WriteOp::put(storage_key(&entry.key), encode(entry)?)))
            .collect::<Result<Vec<_>>>()?;

        self.writer.write(&ops);

        let mut mirror = self.entries.write();
        for entry in entries {
            tracing::debug!(key = %entry.key, fetched_at = %entry.fetched_at, "Cache entry stored");
            mirror.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    /// Whether `key` is older than the configured threshold. Missing keys are stale.
    #[must_use]
    pub fn is_stale(&self, key: &str) -> bool {
        self.is_stale_with(key, self.stale_after)
    }

    /// Whether `key` is older than `threshold`. Missing keys are stale.
    #[must_use]
    pub fn is_stale_with(&self, key: &str, threshold: Duration) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .map_or(true, |entry| entry.is_stale(now, threshold))
    }

    /// Age of the entry for `key`.
    #[must_use]
    pub fn age(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries.read().get(key).map(|entry| entry.age(now))
    }

    /// Cached keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Configured staleness threshold.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Snapshot of the named collections. Entries whose value is not a list
    /// of records are left out.
    #[must_use]
    pub fn snapshot(&self, collections: &[String]) -> CachedData {
        let mirror = self.entries.read();
        let collections = collections
            .iter()
            .filter_map(|name| {
                let entry = mirror.get(name)?;
                let Value::Array(records) = &entry.value else {
                    return None;
                };
                Some((
                    name.clone(),
                    CachedEntity::new(name.as_str(), records.clone(), entry.fetched_at),
                ))
            })
            .collect();

        CachedData { collections }
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.writer.write(&[WriteOp::delete_prefix(CACHE_PREFIX)]);
        let removed = {
            let mut mirror = self.entries.write();
            let removed = mirror.len();
            mirror.clear();
            removed
        };
        tracing::info!(removed, "Cache cleared");
    }

    /// Returns true once storage failed and the cache lives only in memory.
    #[must_use]
    pub fn is_memory_only(&self) -> bool {
        self.writer.is_degraded()
    }
}
