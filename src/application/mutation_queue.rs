//! Mutation queue - durable FIFO of writes waiting for the server.
//!
//! Entries for the same resource type are handed out strictly in enqueue
//! order, one at a time. Rejected entries leave the drain but stay in the
//! queue until the user acknowledges them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;

use crate::domain::{AppError, MutationOperation, MutationStatus, QueuedMutation, RemoteError, Result};
use crate::infrastructure::schema::{decode, encode};
use crate::infrastructure::{Clock, DurableWriter, KeyValueStore, WriteOp};

/// Storage key prefix for queue entries.
const QUEUE_PREFIX: &str = "queue/";

/// Storage key of the id counter.
const NEXT_ID_KEY: &str = "queue-meta/next-id";

/// Storage key of the installation id.
const CLIENT_ID_KEY: &str = "queue-meta/client-id";

/// Zero-padded so that storage order matches id order.
fn entry_key(id: u64) -> String {
    format!("{QUEUE_PREFIX}{id:020}")
}

struct QueueState {
    entries: BTreeMap<u64, QueuedMutation>,
    next_id: u64,
}

/// Durable ordered queue of local writes.
pub struct MutationQueue {
    writer: DurableWriter,
    clock: Arc<dyn Clock>,
    client_id: String,
    state: Mutex<QueueState>,
}

fn new_client_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

/// Installation id, created and persisted on first open.
///
/// A fresh id is generated whenever the stored one is gone, so ids from a
/// wiped or memory-only queue never collide with keys the server has seen.
fn load_client_id(writer: &DurableWriter) -> String {
    let stored = writer
        .store()
        .get(CLIENT_ID_KEY)
        .ok()
        .flatten()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(id) = stored {
        return id;
    }

    let id = new_client_id();
    writer.write(&[WriteOp::put(CLIENT_ID_KEY, id.clone().into_bytes())]);
    tracing::debug!(client_id = %id, "Generated installation id");
    id
}

impl MutationQueue {
    /// Open the queue, loading persisted entries.
    ///
    /// Entries persisted as in-flight were interrupted mid-submission and go
    /// back to pending; the idempotency key makes resubmitting them safe.
    pub fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let writer = DurableWriter::new(store, "queue");
        let mut entries = BTreeMap::new();

        match writer.store().scan_prefix(QUEUE_PREFIX) {
            Ok(rows) => {
                for (key, bytes) in rows {
                    match decode::<QueuedMutation>(&key, &bytes) {
                        Ok(mut entry) => {
                            if entry.status == MutationStatus::InFlight {
                                tracing::info!(mutation_id = entry.id, "Recovering interrupted mutation");
                                entry.status = MutationStatus::Pending;
                            }
                            entries.insert(entry.id, entry);
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "Skipping unreadable queue entry");
                        }
                    }
                }
            }
            Err(e) => writer.degrade(&e.to_string()),
        }

        let persisted_next = writer
            .store()
            .get(NEXT_ID_KEY)
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(1);
        let after_last = entries.keys().next_back().map_or(1, |id| id + 1);
        let next_id = persisted_next.max(after_last);

        let client_id = load_client_id(&writer);

        tracing::debug!(entries = entries.len(), next_id, "Mutation queue loaded");

        Self {
            writer,
            clock,
            client_id,
            state: Mutex::new(QueueState { entries, next_id }),
        }
    }

    /// Installation id that scopes idempotency keys.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Append a pending mutation and return its id.
    ///
    /// # Errors
    /// Returns `JsonParse` if the entry cannot be encoded.
    pub fn enqueue(
        &self,
        resource_type: &str,
        operation: MutationOperation,
        payload: Value,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let id = state.next_id;
        let entry = QueuedMutation::new(id, resource_type, operation, payload, self.clock.now())
            .with_client_id(self.client_id.as_str());

        self.writer.write(&[
            WriteOp::put(entry_key(id), encode(&entry)?),
            WriteOp::put(NEXT_ID_KEY, (id + 1).to_string().into_bytes()),
        ]);

        state.next_id = id + 1;
        state.entries.insert(id, entry);

        tracing::info!(mutation_id = id, resource = resource_type, %operation, "Mutation queued");
        Ok(id)
    }

    /// Oldest pending entry that may be submitted now.
    ///
    /// Failed entries are skipped, and so is every resource type that
    /// already has an entry in flight. With `resource_type` set, only that
    /// resource is considered.
    #[must_use]
    pub fn peek_next(&self, resource_type: Option<&str>) -> Option<QueuedMutation> {
        let state = self.state.lock();
        let mut busy: HashSet<&str> = HashSet::new();

        for entry in state.entries.values() {
            match entry.status {
                MutationStatus::InFlight => {
                    busy.insert(entry.resource_type.as_str());
                }
                MutationStatus::Pending => {
                    let wanted = resource_type.map_or(true, |r| r == entry.resource_type);
                    if wanted && !busy.contains(entry.resource_type.as_str()) {
                        return Some(entry.clone());
                    }
                    // Later entries of this resource must wait behind this one.
                    busy.insert(entry.resource_type.as_str());
                }
                MutationStatus::Applied | MutationStatus::Failed => {}
            }
        }
        None
    }

    /// Mark an entry as submitted.
    ///
    /// # Errors
    /// Returns `NotFound` if no entry has `id`.
    pub fn mark_in_flight(&self, id: u64) -> Result<()> {
        self.update(id, |entry| entry.status = MutationStatus::InFlight)
            .map(|_| ())
    }

    /// Remove an entry the server accepted.
    ///
    /// # Errors
    /// Returns `NotFound` if no entry has `id`.
    pub fn mark_applied(&self, id: u64) -> Result<QueuedMutation> {
        let mut state = self.state.lock();
        let mut entry = state.entries.remove(&id).ok_or_else(|| not_found(id))?;
        self.writer.write(&[WriteOp::delete(entry_key(id))]);

        entry.status = MutationStatus::Applied;
        tracing::debug!(mutation_id = id, "Mutation applied");
        Ok(entry)
    }

    /// Record a failed submission.
    ///
    /// A retryable error (network, timeout) puts the entry back to pending
    /// with one more attempt counted. Anything else is terminal: the entry
    /// is marked failed and stays out of the drain until acknowledged.
    ///
    /// # Errors
    /// Returns `NotFound` if no entry has `id`.
    pub fn mark_failed(&self, id: u64, error: &RemoteError) -> Result<QueuedMutation> {
        let retryable = error.is_retryable();
        let entry = self.update(id, |entry| {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            if retryable {
                entry.status = MutationStatus::Pending;
            } else {
                entry.status = MutationStatus::Failed;
                entry.rejection = error.rejection_kind();
            }
        })?;

        if retryable {
            tracing::debug!(mutation_id = id, attempts = entry.attempts, error = %error, "Mutation will be retried");
        } else {
            tracing::warn!(mutation_id = id, error = %error, "Mutation rejected by server");
        }
        Ok(entry)
    }

    /// Entries rejected by the server and not yet acknowledged.
    #[must_use]
    pub fn failed(&self) -> Vec<QueuedMutation> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.status == MutationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Number of failed entries.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.status == MutationStatus::Failed)
            .count()
    }

    /// Drop a failed entry once the user has seen it.
    ///
    /// # Errors
    /// Returns `NotFound` if `id` is not a failed entry.
    pub fn acknowledge(&self, id: u64) -> Result<QueuedMutation> {
        let mut state = self.state.lock();
        if state.entries.get(&id).map(|e| e.status) != Some(MutationStatus::Failed) {
            return Err(AppError::NotFound {
                message: format!("No failed mutation with id {id}"),
            });
        }

        let entry = state.entries.remove(&id).ok_or_else(|| not_found(id))?;
        self.writer.write(&[WriteOp::delete(entry_key(id))]);
        tracing::info!(mutation_id = id, "Failed mutation acknowledged");
        Ok(entry)
    }

    /// Every entry in enqueue order.
    #[must_use]
    pub fn list(&self) -> Vec<QueuedMutation> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Entries still waiting to reach the server (pending or in flight).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| matches!(e.status, MutationStatus::Pending | MutationStatus::InFlight))
            .count()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the queue holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Discard every entry. Only for explicit user action.
    ///
    /// Ids keep counting up so a discarded id is never reused.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        self.writer.write(&[WriteOp::delete_prefix(QUEUE_PREFIX)]);
        let removed = state.entries.len();
        state.entries.clear();

        tracing::info!(removed, "Mutation queue cleared");
        removed
    }

    /// Returns true once storage failed and the queue lives only in memory.
    #[must_use]
    pub fn is_memory_only(&self) -> bool {
        self.writer.is_degraded()
    }

    fn update(&self, id: u64, change: impl FnOnce(&mut QueuedMutation)) -> Result<QueuedMutation> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id).ok_or_else(|| not_found(id))?;
        change(entry);
        let snapshot = entry.clone();

        self.writer.write(&[WriteOp::put(entry_key(id), encode(&snapshot)?)]);
        Ok(snapshot)
    }
}

fn not_found(id: u64) -> AppError {
    AppError::NotFound {
        message: format!("No queued mutation with id {id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RejectionKind;
    use crate::infrastructure::durable::tests::BrokenStore;
    use crate::infrastructure::{MemoryKvStore, SystemClock};
    use serde_json::json;

    fn open(store: Arc<dyn KeyValueStore>) -> MutationQueue {
        MutationQueue::open(store, Arc::new(SystemClock))
    }

    fn memory_queue() -> MutationQueue {
        open(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let queue = memory_queue();
        let a = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        let b = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        assert!(b > a);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_same_resource_waits_for_in_flight() {
        let queue = memory_queue();
        let first = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        let second = queue.enqueue("children", MutationOperation::Update, json!({ "id": "c-1" })).unwrap();
        let other = queue.enqueue("appointments", MutationOperation::Create, json!({})).unwrap();

        assert_eq!(queue.peek_next(None).unwrap().id, first);
        queue.mark_in_flight(first).unwrap();

        // children is busy, so the appointment goes next
        assert_eq!(queue.peek_next(None).unwrap().id, other);
        assert!(queue.peek_next(Some("children")).is_none());

        queue.mark_applied(first).unwrap();
        assert_eq!(queue.peek_next(Some("children")).unwrap().id, second);
    }

    #[test]
    fn test_retryable_failure_returns_to_pending() {
        let queue = memory_queue();
        let id = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        queue.mark_in_flight(id).unwrap();

        let entry = queue.mark_failed(id, &RemoteError::Timeout).unwrap();

        assert_eq!(entry.status, MutationStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(queue.peek_next(None).unwrap().id, id);
    }

    #[test]
    fn test_rejection_is_terminal_until_acknowledged() {
        let queue = memory_queue();
        let bad = queue.enqueue("children", MutationOperation::Create, json!("oops")).unwrap();
        let good = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();

        queue.mark_in_flight(bad).unwrap();
        let entry = queue
            .mark_failed(bad, &RemoteError::Validation("name required".into()))
            .unwrap();

        assert_eq!(entry.status, MutationStatus::Failed);
        assert_eq!(entry.rejection, Some(RejectionKind::Validation));
        assert_eq!(queue.peek_next(None).unwrap().id, good);
        assert_eq!(queue.failed().len(), 1);
        assert_eq!(queue.pending_count(), 1);

        assert!(queue.acknowledge(good).is_err());
        queue.acknowledge(bad).unwrap();
        assert!(queue.failed().is_empty());
    }

    #[test]
    fn test_reload_keeps_order_and_recovers_in_flight() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let queue = open(store.clone());
        let ids: Vec<u64> = (0..12)
            .map(|n| {
                queue
                    .enqueue("children", MutationOperation::Create, json!({ "n": n }))
                    .unwrap()
            })
            .collect();
        queue.mark_in_flight(ids[0]).unwrap();
        drop(queue);

        let reopened = open(store);
        let listed: Vec<u64> = reopened.list().iter().map(|e| e.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(reopened.list()[0].status, MutationStatus::Pending);
        assert_eq!(reopened.peek_next(None).unwrap().id, ids[0]);

        let next = reopened.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        assert!(next > ids[11]);
    }

    #[test]
    fn test_clear_does_not_reuse_ids() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let queue = open(store.clone());
        let id = queue.enqueue("children", MutationOperation::Delete, json!({ "id": "c-1" })).unwrap();

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());

        let reopened = open(store);
        assert!(reopened.is_empty());
        let next = reopened.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        assert!(next > id);
    }

    #[test]
    fn test_installation_id_scopes_idempotency_keys() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let queue = open(store.clone());
        let id = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();
        let key = queue.list()[0].idempotency_key();
        assert_eq!(key, format!("{}-{id}", queue.client_id()));
        let client_id = queue.client_id().to_string();
        drop(queue);

        let reopened = open(store);
        assert_eq!(reopened.client_id(), client_id);
        assert_eq!(reopened.list()[0].idempotency_key(), key);

        // a wiped store restarts ids but not keys
        let wiped = memory_queue();
        assert_eq!(wiped.enqueue("children", MutationOperation::Create, json!({})).unwrap(), id);
        assert_ne!(wiped.list()[0].idempotency_key(), key);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let queue = memory_queue();
        assert!(matches!(queue.mark_in_flight(42), Err(AppError::NotFound { .. })));
        assert!(matches!(queue.mark_applied(42), Err(AppError::NotFound { .. })));
    }

    #[test]
    fn test_storage_failure_keeps_queue_in_memory() {
        let queue = open(Arc::new(BrokenStore));
        let id = queue.enqueue("children", MutationOperation::Create, json!({})).unwrap();

        assert!(queue.is_memory_only());
        assert_eq!(queue.peek_next(None).unwrap().id, id);
    }
}
