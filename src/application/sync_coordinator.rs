//! Sync coordinator - drains the mutation queue and refreshes the cache.
//!
//! At most one session runs at a time. The guard is taken synchronously
//! before the first await, so triggers that race in the same tick start
//! exactly one drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::backoff::Backoff;
use super::cache_store::CacheStore;
use super::mutation_queue::MutationQueue;
use super::network_monitor::NetworkMonitor;
use super::service_worker::ServiceWorkerController;
use crate::domain::{
    AppConfig, FetchScope, MutationOutcome, QueuedMutation, RemoteError, RetryConfig, SyncOutcome,
    SyncSession, SyncState, SyncStatus, TriggerResult,
};
use crate::infrastructure::{Clock, RemoteClient, RemoteResult, WorkerMessage};

/// Capacity of the mutation outcome channel.
const OUTCOME_CAPACITY: usize = 64;

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Collections fetched into the cache after every drain.
    pub collections: Vec<String>,
    /// Scope sent with every fetch.
    pub scope: FetchScope,
    /// How long `Synced` is shown before returning to `Idle`.
    pub grace: Duration,
    /// Timeout for each remote call.
    pub request_timeout: Duration,
    /// Retry backoff after network failures.
    pub retry: RetryConfig,
}

impl CoordinatorSettings {
    /// Settings from the application config.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            collections: config.cache.tracked_collections.clone(),
            scope: config.remote.scope.clone(),
            grace: config.grace_window(),
            request_timeout: Duration::from_secs(config.sync.request_timeout_secs),
            retry: config.sync.retry.clone(),
        }
    }
}

struct RunState {
    state: SyncState,
    last_session: Option<SyncSession>,
    backoff: Backoff,
    next_retry_at: Option<DateTime<Utc>>,
    retry_task: Option<JoinHandle<()>>,
    settle_task: Option<JoinHandle<()>>,
}

/// Runs sync sessions and reports their progress.
pub struct SyncCoordinator {
    cache: Arc<CacheStore>,
    queue: Arc<MutationQueue>,
    network: Arc<NetworkMonitor>,
    remote: Arc<dyn RemoteClient>,
    clock: Arc<dyn Clock>,
    worker: Option<Arc<ServiceWorkerController>>,
    settings: CoordinatorSettings,
    run: Mutex<RunState>,
    status_tx: watch::Sender<SyncStatus>,
    outcomes_tx: broadcast::Sender<MutationOutcome>,
    sessions_started: AtomicU64,
}

impl SyncCoordinator {
    /// Create an idle coordinator.
    pub fn new(
        cache: Arc<CacheStore>,
        queue: Arc<MutationQueue>,
        network: Arc<NetworkMonitor>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus {
            pending: queue.pending_count(),
            failed: queue.failed_count(),
            ..SyncStatus::default()
        });
        let (outcomes_tx, _) = broadcast::channel(OUTCOME_CAPACITY);

        Self {
            cache,
            queue,
            network,
            remote,
            clock,
            worker: None,
            run: Mutex::new(RunState {
                state: SyncState::Idle,
                last_session: None,
                backoff: Backoff::new(settings.retry.clone()),
                next_retry_at: None,
                retry_task: None,
                settle_task: None,
            }),
            settings,
            status_tx,
            outcomes_tx,
            sessions_started: AtomicU64::new(0),
        }
    }

    /// Tell `worker` when a session completes.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<ServiceWorkerController>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.run.lock().state
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Follow status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Follow per-mutation outcomes.
    #[must_use]
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<MutationOutcome> {
        self.outcomes_tx.subscribe()
    }

    /// Number of sessions started so far.
    #[must_use]
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    /// Collections refreshed after each drain.
    #[must_use]
    pub fn collections(&self) -> &[String] {
        &self.settings.collections
    }

    /// Republish status, e.g. after the queue changed outside a session.
    pub fn publish_status(&self) {
        let run = self.run.lock();
        self.publish(&run);
    }

    /// Run a session now unless one is active or the device is offline.
    pub async fn sync(self: &Arc<Self>) -> TriggerResult {
        if !self.network.is_online() {
            tracing::debug!("Offline, sync skipped");
            return TriggerResult::Offline;
        }
        if !self.try_begin() {
            tracing::debug!("Sync already in progress, trigger ignored");
            return TriggerResult::AlreadySyncing;
        }

        let (session, retryable) = self.run_session().await;
        self.complete(&session, retryable);

        // Writes queued while the cache was refreshing.
        if session.error.is_none() && self.network.is_online() && self.queue.peek_next(None).is_some() {
            tracing::debug!("More mutations queued during sync, scheduling another pass");
            drop(self.trigger());
        }

        TriggerResult::Completed(session)
    }

    /// Start a session in the background.
    pub fn trigger(self: &Arc<Self>) -> JoinHandle<TriggerResult> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.sync().await })
    }

    /// Wait until no session is running.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.status_tx.subscribe();
        let result = rx.wait_for(|s| s.state != SyncState::Syncing).await.map(drop);
        if let Err(e) = result {
            tracing::debug!(error = %e, "Status channel closed");
        }
    }

    /// Cancel scheduled retries and timers.
    pub fn shutdown(&self) {
        let mut run = self.run.lock();
        if let Some(task) = run.retry_task.take() {
            task.abort();
        }
        if let Some(task) = run.settle_task.take() {
            task.abort();
        }
        run.next_retry_at = None;
    }

    fn try_begin(&self) -> bool {
        let mut run = self.run.lock();
        if !run.state.can_start_sync() {
            return false;
        }

        run.state = SyncState::Syncing;
        run.next_retry_at = None;
        if let Some(task) = run.retry_task.take() {
            task.abort();
        }
        if let Some(task) = run.settle_task.take() {
            task.abort();
        }
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.publish(&run);

        tracing::info!(pending = self.queue.pending_count(), "Sync started");
        true
    }

    async fn run_session(&self) -> (SyncSession, bool) {
        let mut session = SyncSession::begin(self.clock.now());

        let result = match self.drain(&mut session).await {
            Ok(()) => self.refresh(&mut session).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => (session.finish(self.clock.now()), false),
            Err(e) => {
                let retryable = e.is_retryable();
                (session.with_error(e.to_string()).finish(self.clock.now()), retryable)
            }
        }
    }

    /// Submit queued mutations until the queue is empty or the network fails.
    async fn drain(&self, session: &mut SyncSession) -> RemoteResult<()> {
        while let Some(mutation) = self.queue.peek_next(None) {
            if !self.network.is_online() {
                return Err(RemoteError::Network("connection lost during sync".into()));
            }
            if self.queue.mark_in_flight(mutation.id).is_err() {
                // cleared by the user since the peek
                continue;
            }

            match self.submit(&mutation).await {
                Ok(_) => {
                    if let Err(e) = self.queue.mark_applied(mutation.id) {
                        tracing::debug!(mutation_id = mutation.id, error = %e, "Applied mutation already gone");
                    }
                    session.applied_count += 1;
                    self.emit(MutationOutcome::Applied {
                        id: mutation.id,
                        resource_type: mutation.resource_type.clone(),
                    });
                }
                Err(error) if error.is_retryable() => {
                    if let Err(e) = self.queue.mark_failed(mutation.id, &error) {
                        tracing::debug!(mutation_id = mutation.id, error = %e, "Interrupted mutation already gone");
                    }
                    return Err(error);
                }
                Err(error) => {
                    session.failed_count += 1;
                    match self.queue.mark_failed(mutation.id, &error) {
                        Ok(failed) => {
                            if let Some(kind) = error.rejection_kind() {
                                self.emit(MutationOutcome::Rejected {
                                    mutation: failed,
                                    kind,
                                    message: error.to_string(),
                                });
                            }
                        }
                        Err(e) => {
                            tracing::debug!(mutation_id = mutation.id, error = %e, "Rejected mutation already gone");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch every tracked collection and merge them into the cache together.
    ///
    /// The server snapshot wins over local state; nothing is merged unless
    /// every fetch succeeded.
    async fn refresh(&self, session: &mut SyncSession) -> RemoteResult<()> {
        let mut fetched = Vec::with_capacity(self.settings.collections.len());

        for name in &self.settings.collections {
            if !self.network.is_online() {
                return Err(RemoteError::Network("connection lost during refresh".into()));
            }
            let records = tokio::time::timeout(
                self.settings.request_timeout,
                self.remote.fetch_collection(name, &self.settings.scope),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout))?;

            tracing::debug!(collection = %name, records = records.len(), "Collection fetched");
            fetched.push((name.clone(), Value::Array(records)));
        }

        if let Err(e) = self.cache.put_many(fetched, self.clock.now()) {
            tracing::warn!(error = %e, "Could not store refreshed collections");
            return Ok(());
        }
        session.refreshed.clone_from(&self.settings.collections);
        Ok(())
    }

    async fn submit(&self, mutation: &QueuedMutation) -> RemoteResult<Value> {
        tracing::debug!(
            mutation_id = mutation.id,
            resource = %mutation.resource_type,
            operation = %mutation.operation,
            attempt = mutation.attempts + 1,
            "Submitting mutation"
        );

        tokio::time::timeout(self.settings.request_timeout, self.remote.apply_mutation(mutation))
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }

    fn complete(self: &Arc<Self>, session: &SyncSession, retryable: bool) {
        let mut run = self.run.lock();
        run.last_session = Some(session.clone());

        if session.outcome == SyncOutcome::Error {
            run.state = SyncState::Error;
            if retryable {
                let delay = run.backoff.next_delay();
                run.next_retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| self.clock.now() + d);
                run.retry_task = Some(self.spawn_retry(delay));
                tracing::warn!(
                    error = session.error.as_deref().unwrap_or_default(),
                    attempt = run.backoff.attempt(),
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Sync failed, retry scheduled"
                );
            } else {
                tracing::warn!(
                    error = session.error.as_deref().unwrap_or_default(),
                    "Sync failed"
                );
            }
        } else {
            run.state = SyncState::Synced;
            run.backoff.reset();
            tracing::info!(
                applied = session.applied_count,
                failed = session.failed_count,
                refreshed = session.refreshed.len(),
                "Sync complete"
            );
        }

        run.settle_task = Some(self.spawn_settle());
        self.publish(&run);
        drop(run);

        if session.outcome != SyncOutcome::Error {
            if let Some(worker) = &self.worker {
                worker.send_message(&WorkerMessage::SyncComplete {
                    applied: session.applied_count,
                    failed: session.failed_count,
                });
            }
        }
    }

    fn spawn_retry(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            // Detach from the slot so the new session does not abort us.
            {
                let mut run = this.run.lock();
                run.retry_task.take();
                run.next_retry_at = None;
                this.publish(&run);
            }
            tracing::debug!("Retrying sync");
            this.sync().await;
        })
    }

    fn spawn_settle(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let grace = self.settings.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(this) = weak.upgrade() {
                this.settle();
            }
        })
    }

    fn settle(&self) {
        let mut run = self.run.lock();
        if matches!(run.state, SyncState::Synced | SyncState::Error) {
            run.state = SyncState::Idle;
            run.settle_task = None;
            self.publish(&run);
        }
    }

    fn publish(&self, run: &RunState) {
        self.status_tx.send_replace(SyncStatus {
            state: run.state,
            last_session: run.last_session.clone(),
            pending: self.queue.pending_count(),
            failed: self.queue.failed_count(),
            next_retry_at: run.next_retry_at,
        });
    }

    fn emit(&self, outcome: MutationOutcome) {
        if self.outcomes_tx.send(outcome).is_err() {
            tracing::trace!("No outcome subscribers");
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
