//! Write path that degrades to memory-only when storage fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kv_store::{KeyValueStore, WriteOp};

/// Persists batches for one component and remembers if storage failed.
///
/// After the first failed write the component keeps running from memory
/// for the rest of the session and logs a single warning.
pub struct DurableWriter {
    store: Arc<dyn KeyValueStore>,
    component: &'static str,
    degraded: AtomicBool,
}

impl DurableWriter {
    /// Create a writer for `component` over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, component: &'static str) -> Self {
        Self {
            store,
            component,
            degraded: AtomicBool::new(false),
        }
    }

    /// Underlying store, for loading persisted state.
    #[must_use]
    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Persist a batch. Returns false if the batch only lives in memory.
    pub fn write(&self, ops: &[WriteOp]) -> bool {
        if self.degraded.load(Ordering::Acquire) {
            return false;
        }

        match self.store.write_batch(ops) {
            Ok(()) => true,
            Err(e) => {
                self.degrade(&e.to_string());
                false
            }
        }
    }

    /// Switch to memory-only mode, warning once.
    pub fn degrade(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                component = self.component,
                location = %self.store.location(),
                error = reason,
                "Local storage unavailable, continuing memory-only for this session"
            );
        }
    }

    /// Returns true once writes stopped reaching storage.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}
