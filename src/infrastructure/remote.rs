//! Remote backend contract and an in-process implementation.
//!
//! A `RemoteClient` must treat a repeated idempotency key as a replay of
//! the first submission: same response, no second server-side effect.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::domain::{FetchScope, MutationOperation, QueuedMutation, RemoteError};

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// The hosted backend as seen by the sync coordinator.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the current server snapshot of a collection.
    async fn fetch_collection(&self, name: &str, scope: &FetchScope) -> RemoteResult<Vec<Value>>;

    /// Apply a queued mutation, keyed by `mutation.idempotency_key()`.
    async fn apply_mutation(&self, mutation: &QueuedMutation) -> RemoteResult<Value>;
}

#[derive(Default)]
struct ServerState {
    collections: BTreeMap<String, Vec<Value>>,
    replies: HashMap<String, RemoteResult<Value>>,
    applied_order: Vec<u64>,
    scripted_failures: Vec<RemoteError>,
    next_record: u64,
}

/// In-process backend honouring idempotency keys.
///
/// Update and delete of a missing record are conflicts, a create whose
/// payload is not an object fails validation. Counts every call so tests
/// can observe exactly how many network operations happened.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    apply_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemoryRemote {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the server contents of a collection.
    pub fn seed(&self, collection: &str, records: Vec<Value>) {
        self.state
            .lock()
            .collections
            .insert(collection.to_string(), records);
    }

    /// Simulate the backend becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next calls fail with `error`, in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().scripted_failures.push(error);
    }

    /// Server contents of a collection.
    #[must_use]
    pub fn collection(&self, name: &str) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue ids in the order their effects were applied.
    #[must_use]
    pub fn applied_order(&self) -> Vec<u64> {
        self.state.lock().applied_order.clone()
    }

    /// Number of `apply_mutation` calls, replays included.
    #[must_use]
    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_collection` calls.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, state: &mut ServerState) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".into()));
        }
        if !state.scripted_failures.is_empty() {
            return Err(state.scripted_failures.remove(0));
        }
        Ok(())
    }

    fn execute(state: &mut ServerState, mutation: &QueuedMutation) -> RemoteResult<Value> {
        let records = state
            .collections
            .entry(mutation.resource_type.clone())
            .or_default();

        match mutation.operation {
            MutationOperation::Create => {
                let Value::Object(mut fields) = mutation.payload.clone() else {
                    return Err(RemoteError::Validation("payload must be an object".into()));
                };
                if !fields.contains_key("id") {
                    state.next_record += 1;
                    fields.insert("id".into(), Value::String(format!("srv-{}", state.next_record)));
                }
                let record = Value::Object(fields);
                records.push(record.clone());
                Ok(record)
            }
            MutationOperation::Update => {
                let id = mutation
                    .record_id()
                    .ok_or_else(|| RemoteError::Validation("update requires an id".into()))?;
                let record = records
                    .iter_mut()
                    .find(|r| record_id(r).as_deref() == Some(id.as_str()))
                    .ok_or_else(|| RemoteError::Conflict(format!("record {id} no longer exists")))?;
                if let (Value::Object(target), Value::Object(changes)) = (record, &mutation.payload)
                {
                    merge_fields(target, changes);
                    return Ok(Value::Object(target.clone()));
                }
                Err(RemoteError::Validation("payload must be an object".into()))
            }
            MutationOperation::Delete => {
                let id = mutation
                    .record_id()
                    .ok_or_else(|| RemoteError::Validation("delete requires an id".into()))?;
                let before = records.len();
                records.retain(|r| record_id(r).as_deref() != Some(id.as_str()));
                if records.len() == before {
                    return Err(RemoteError::Conflict(format!("record {id} no longer exists")));
                }
                Ok(Value::Null)
            }
        }
    }
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn merge_fields(target: &mut Map<String, Value>, changes: &Map<String, Value>) {
    for (k, v) in changes {
        target.insert(k.clone(), v.clone());
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn fetch_collection(&self, name: &str, _scope: &FetchScope) -> RemoteResult<Vec<Value>> {
        tokio::task::yield_now().await;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        self.check_reachable(&mut state)?;
        Ok(state.collections.get(name).cloned().unwrap_or_default())
    }

    async fn apply_mutation(&self, mutation: &QueuedMutation) -> RemoteResult<Value> {
        tokio::task::yield_now().await;
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        self.check_reachable(&mut state)?;

        let key = mutation.idempotency_key();
        if let Some(reply) = state.replies.get(&key) {
            tracing::debug!(key = %key, "Replaying idempotent mutation");
            return reply.clone();
        }

        let reply = Self::execute(&mut state, mutation);
        if reply.is_ok() {
            state.applied_order.push(mutation.id);
        }
        state.replies.insert(key, reply.clone());
        reply
    }
}
