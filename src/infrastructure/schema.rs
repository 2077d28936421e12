//! Versioned encoding of persisted records.
//!
//! Every record is stored as `{"v": <version>, "data": <record>}`. Records
//! written before versioning existed have no envelope and decode as
//! version 0, which each record type may migrate forward.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{AppError, CachedEntity, QueuedMutation, Result};

/// A record type with a persisted schema version.
pub trait Versioned: Serialize + DeserializeOwned {
    /// Version written by this build.
    const VERSION: u32;

    /// Upgrade a raw record from `from` to the shape of `VERSION`.
    ///
    /// # Errors
    /// Returns `SchemaVersion` when no migration path exists.
    fn migrate(key: &str, from: u32, raw: Value) -> Result<Value> {
        let _ = raw;
        Err(AppError::SchemaVersion {
            key: key.to_string(),
            found: from,
            supported: Self::VERSION,
        })
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    data: Value,
}

/// Encode a record with its current version.
///
/// # Errors
/// Returns `JsonParse` if the record cannot be serialized.
pub fn encode<T: Versioned>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(&EnvelopeRef {
        v: T::VERSION,
        data: record,
    })
    .map_err(AppError::json_parse)
}

/// Decode a record, migrating older versions.
///
/// # Errors
/// Returns `SchemaVersion` for records newer than this build or without a
/// migration path, `JsonParse` for malformed data.
pub fn decode<T: Versioned>(key: &str, bytes: &[u8]) -> Result<T> {
    let raw: Value = serde_json::from_slice(bytes).map_err(AppError::json_parse)?;

    let is_envelope = matches!(
        &raw,
        Value::Object(map) if map.contains_key("v") && map.contains_key("data")
    );
    let (version, data) = if is_envelope {
        let envelope: Envelope = serde_json::from_value(raw).map_err(AppError::json_parse)?;
        (envelope.v, envelope.data)
    } else {
        (0, raw)
    };

    let data = match version.cmp(&T::VERSION) {
        std::cmp::Ordering::Equal => data,
        std::cmp::Ordering::Less => {
            tracing::debug!(key, from = version, to = T::VERSION, "Migrating persisted record");
            T::migrate(key, version, data)?
        }
        std::cmp::Ordering::Greater => {
            return Err(AppError::SchemaVersion {
                key: key.to_string(),
                found: version,
                supported: T::VERSION,
            })
        }
    };

    serde_json::from_value(data).map_err(AppError::json_parse)
}

impl Versioned for CachedEntity<Value> {
    const VERSION: u32 = 1;

    /// Version 0 is the unversioned blob older clients wrote: either the bare
    /// value or `{ "data": ..., "timestamp": <epoch ms> }`.
    /// Without a timestamp the entry is treated as fetched at the epoch.
    fn migrate(key: &str, from: u32, raw: Value) -> Result<Value> {
        if from != 0 {
            return Err(AppError::SchemaVersion {
                key: key.to_string(),
                found: from,
                supported: Self::VERSION,
            });
        }

        let collection = key.rsplit('/').next().unwrap_or(key);
        let (value, fetched_at) = match raw {
            Value::Object(mut map) if map.contains_key("data") => {
                let fetched_at = map
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .and_then(DateTime::from_timestamp_millis)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                (map.remove("data").unwrap_or(Value::Null), fetched_at)
            }
            bare => (bare, DateTime::<Utc>::UNIX_EPOCH),
        };

        serde_json::to_value(CachedEntity::new(collection, value, fetched_at))
            .map_err(AppError::json_parse)
    }
}

impl Versioned for QueuedMutation {
    const VERSION: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MutationOperation;
    use serde_json::json;

    #[test]
    fn test_current_version_round_trips() {
        let m = QueuedMutation::new(
            3,
            "children",
            MutationOperation::Create,
            json!({ "name": "Emma" }),
            Utc::now(),
        );
        let bytes = encode(&m).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["v"], 1);

        let decoded: QueuedMutation = decode("queue/3", &bytes).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_legacy_cache_array_migrates_as_stale() {
        let bytes = serde_json::to_vec(&json!([{ "id": "c-1" }])).unwrap();
        let entry: CachedEntity<Value> = decode("cache/children", &bytes).unwrap();

        assert_eq!(entry.key, "children");
        assert_eq!(entry.value, json!([{ "id": "c-1" }]));
        assert_eq!(entry.fetched_at, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_legacy_cache_object_keeps_timestamp() {
        let bytes =
            serde_json::to_vec(&json!({ "data": [], "timestamp": 1_700_000_000_000_i64 })).unwrap();
        let entry: CachedEntity<Value> = decode("cache/reminders", &bytes).unwrap();

        assert_eq!(entry.fetched_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let bytes = serde_json::to_vec(&json!({ "v": 9, "data": {} })).unwrap();
        let err = decode::<QueuedMutation>("queue/1", &bytes).unwrap_err();
        assert!(matches!(err, AppError::SchemaVersion { found: 9, .. }));
    }

    #[test]
    fn test_unversioned_mutation_has_no_migration() {
        let bytes = serde_json::to_vec(&json!({ "type": "create_child" })).unwrap();
        assert!(decode::<QueuedMutation>("queue/1", &bytes).is_err());
    }
}
