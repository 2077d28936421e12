//! Offline engine - wires the components together and exposes the API the
//! UI calls.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::cache_store::CacheStore;
use super::install_prompt::{InstallOutcome, InstallPromptManager};
use super::mutation_queue::MutationQueue;
use super::network_monitor::NetworkMonitor;
use super::observers::Subscription;
use super::service_worker::{ActivationOutcome, RegistrationOutcome, ServiceWorkerController};
use super::sync_coordinator::{CoordinatorSettings, SyncCoordinator};
use crate::domain::{
    AppConfig, AppError, CachedData, ConnectivityState, MutationOperation, MutationOutcome,
    QueuedMutation, Reminder, Result, SyncOutcome, SyncSession, SyncStatus, TriggerResult,
    REMINDERS,
};
use crate::infrastructure::{
    Clock, ConnectivityProbe, HeadlessWorkerHost, KeyValueStore, MemoryKvStore, MessageKind,
    RemoteClient, RestRemoteClient, SqliteKvStore, StaticProbe, SystemClock, TcpProbe, WorkerHost,
    WorkerMessage,
};

/// Script path of the background worker.
const WORKER_SCRIPT: &str = "/sw.js";

/// How long the reachability probe waits for the backend.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Builds an [`OfflineEngine`], defaulting every port from the config.
pub struct EngineBuilder {
    config: AppConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    remote: Option<Arc<dyn RemoteClient>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    worker_host: Option<Arc<dyn WorkerHost>>,
    clock: Option<Arc<dyn Clock>>,
    standalone: bool,
}

impl EngineBuilder {
    /// Use `store` instead of the SQLite file in the data directory.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `remote` instead of the configured REST backend.
    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use `probe` for connectivity samples.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use `host` for the background worker.
    #[must_use]
    pub fn worker_host(mut self, host: Arc<dyn WorkerHost>) -> Self {
        self.worker_host = Some(host);
        self
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The app was launched installed (standalone display mode).
    #[must_use]
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    /// Build the engine. Background tasks start with [`OfflineEngine::start`].
    ///
    /// # Errors
    /// Returns `Config` if no remote was given and none is configured.
    pub fn build(self) -> Result<OfflineEngine> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => open_store(&config),
        };
        let remote = match self.remote {
            Some(remote) => remote,
            None => configured_remote(&config)?,
        };
        let probe = match self.probe {
            Some(probe) => probe,
            None => configured_probe(&config)?,
        };
        let host = self
            .worker_host
            .unwrap_or_else(|| Arc::new(HeadlessWorkerHost));

        let cache = Arc::new(CacheStore::open(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.stale_threshold(),
        ));
        let queue = Arc::new(MutationQueue::open(Arc::clone(&store), Arc::clone(&clock)));
        let network = Arc::new(NetworkMonitor::new(probe.as_ref(), Arc::clone(&clock)));
        let worker = Arc::new(ServiceWorkerController::new(host, WORKER_SCRIPT));
        let install = Arc::new(InstallPromptManager::new(
            store,
            Arc::clone(&clock),
            config.dismiss_cooldown(),
            self.standalone,
        ));
        let coordinator = Arc::new(
            SyncCoordinator::new(
                Arc::clone(&cache),
                Arc::clone(&queue),
                Arc::clone(&network),
                remote,
                Arc::clone(&clock),
                CoordinatorSettings::from_config(&config),
            )
            .with_worker(Arc::clone(&worker)),
        );

        Ok(OfflineEngine {
            config,
            clock,
            probe,
            cache,
            queue,
            network,
            worker,
            install,
            coordinator,
            tasks: Mutex::new(Vec::new()),
            worker_subscription: Mutex::new(None),
        })
    }
}

/// Open the SQLite store, falling back to memory for this session.
fn open_store(config: &AppConfig) -> Arc<dyn KeyValueStore> {
    let path = config.storage_db_path();
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "Cannot create data directory");
        }
    }

    match SqliteKvStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "Local storage unavailable, continuing memory-only for this session");
            Arc::new(MemoryKvStore::new())
        }
    }
}

fn configured_remote(config: &AppConfig) -> Result<Arc<dyn RemoteClient>> {
    let base_url = config.remote.base_url.as_deref().ok_or_else(|| AppError::Config {
        message: "No backend configured; set remote.base_url in config.toml".into(),
    })?;
    let api_key = std::env::var(&config.remote.api_key_env).ok();
    if api_key.is_none() {
        tracing::warn!(var = %config.remote.api_key_env, "API key not set, requests will be anonymous");
    }

    let timeout = Duration::from_secs(config.sync.request_timeout_secs);
    Ok(Arc::new(RestRemoteClient::new(base_url, api_key, timeout)?))
}

fn configured_probe(config: &AppConfig) -> Result<Arc<dyn ConnectivityProbe>> {
    match config.remote.base_url.as_deref() {
        Some(url) => Ok(Arc::new(TcpProbe::from_url(url, PROBE_TIMEOUT)?)),
        None => Ok(Arc::new(StaticProbe(true))),
    }
}

/// The offline-first data layer of the parent portal.
pub struct OfflineEngine {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ConnectivityProbe>,
    cache: Arc<CacheStore>,
    queue: Arc<MutationQueue>,
    network: Arc<NetworkMonitor>,
    worker: Arc<ServiceWorkerController>,
    install: Arc<InstallPromptManager>,
    coordinator: Arc<SyncCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    worker_subscription: Mutex<Option<Subscription>>,
}

impl OfflineEngine {
    /// Start building an engine from `config`.
    #[must_use]
    pub const fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            remote: None,
            probe: None,
            worker_host: None,
            clock: None,
            standalone: false,
        }
    }

    /// Register the background worker and start the automatic sync triggers.
    ///
    /// Must be called from within a tokio runtime; outside one, only the
    /// worker registration happens.
    pub fn start(&self) -> RegistrationOutcome {
        let registration = self.worker.register();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, automatic sync disabled");
            return registration;
        };
        if !self.config.sync.enabled {
            tracing::info!("Automatic sync disabled by configuration");
            return registration;
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return registration;
        }

        let weak = Arc::downgrade(&self.coordinator);
        let handler_runtime = runtime.clone();
        let token = self.worker.on_message(MessageKind::SyncTriggered, move |_| {
            if let Some(coordinator) = weak.upgrade() {
                handler_runtime.spawn(async move {
                    coordinator.sync().await;
                });
            }
        });
        *self.worker_subscription.lock() = Some(token);

        if self.config.sync.sync_on_reconnect {
            tasks.push(runtime.spawn(sync_on_reconnect(
                self.network.watch(),
                Arc::downgrade(&self.coordinator),
            )));
        }
        if self.config.sync.interval_secs > 0 {
            tasks.push(runtime.spawn(sync_on_interval(
                Duration::from_secs(self.config.sync.interval_secs),
                Arc::downgrade(&self.coordinator),
            )));
        }

        tracing::info!(
            online = self.network.is_online(),
            pending = self.queue.pending_count(),
            "Offline engine started"
        );
        registration
    }

    /// Stop background tasks and scheduled retries.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(token) = self.worker_subscription.lock().take() {
            self.worker.unsubscribe(token);
        }
        self.coordinator.shutdown();
        tracing::debug!("Offline engine stopped");
    }

    /// Everything cached for the tracked collections.
    #[must_use]
    pub fn get_cached_data(&self) -> CachedData {
        self.cache.snapshot(self.coordinator.collections())
    }

    /// Cached reminders due between today and `window_days` from now,
    /// soonest first.
    #[must_use]
    pub fn get_upcoming_reminders(&self, window_days: u32) -> Vec<Reminder> {
        let today = self.clock.now().date_naive();
        let last_day = today + chrono::Days::new(u64::from(window_days));

        let Some(entry) = self.cache.get(REMINDERS) else {
            return Vec::new();
        };
        let Value::Array(records) = entry.value else {
            return Vec::new();
        };

        let mut reminders: Vec<Reminder> = records
            .iter()
            .filter_map(Reminder::from_record)
            .filter(|r| r.due_date >= today && r.due_date <= last_day)
            .collect();
        reminders.sort_by_key(|r| r.due_date);
        reminders
    }

    /// Every queued mutation in enqueue order.
    #[must_use]
    pub fn get_sync_queue(&self) -> Vec<QueuedMutation> {
        self.queue.list()
    }

    /// Discard all queued mutations. Returns how many were dropped.
    pub fn clear_sync_queue(&self) -> usize {
        let removed = self.queue.clear();
        self.coordinator.publish_status();
        removed
    }

    /// Sync now, waiting for a running session first.
    ///
    /// # Errors
    /// Returns `NetworkUnavailable` when offline or when the session failed.
    pub async fn force_refresh(&self) -> Result<SyncSession> {
        loop {
            match self.coordinator.sync().await {
                TriggerResult::Completed(session) => {
                    if session.outcome == SyncOutcome::Error {
                        return Err(AppError::NetworkUnavailable {
                            message: session.error.unwrap_or_default(),
                        });
                    }
                    return Ok(session);
                }
                TriggerResult::Offline => {
                    return Err(AppError::NetworkUnavailable {
                        message: "device is offline".into(),
                    });
                }
                TriggerResult::AlreadySyncing => self.coordinator.wait_until_idle().await,
            }
        }
    }

    /// Whether any tracked collection is missing or older than the threshold.
    #[must_use]
    pub fn is_data_stale(&self) -> bool {
        self.coordinator
            .collections()
            .iter()
            .any(|name| self.cache.is_stale(name))
    }

    /// Whether the device is offline.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        !self.network.is_online()
    }

    /// Run a session and wait for it.
    pub async fn sync_with_server(&self) -> TriggerResult {
        self.coordinator.sync().await
    }

    /// Start a session in the background.
    pub fn trigger_sync(&self) -> JoinHandle<TriggerResult> {
        self.coordinator.trigger()
    }

    /// Queue a local write; it is sent right away when online.
    ///
    /// # Errors
    /// Returns `JsonParse` if the payload cannot be stored.
    pub fn enqueue_mutation(
        &self,
        resource_type: &str,
        operation: MutationOperation,
        payload: Value,
    ) -> Result<u64> {
        let id = self.queue.enqueue(resource_type, operation, payload)?;
        self.coordinator.publish_status();

        if self.config.sync.enabled
            && self.config.sync.sync_on_enqueue
            && self.network.is_online()
            && tokio::runtime::Handle::try_current().is_ok()
        {
            drop(self.coordinator.trigger());
        }
        Ok(id)
    }

    /// Remove a rejected mutation after the user has seen it.
    ///
    /// # Errors
    /// Returns `NotFound` if `id` is not a failed mutation.
    pub fn acknowledge_failure(&self, id: u64) -> Result<QueuedMutation> {
        let entry = self.queue.acknowledge(id)?;
        self.coordinator.publish_status();
        Ok(entry)
    }

    /// Show the platform install prompt.
    pub fn install_app(&self) -> InstallOutcome {
        self.install.prompt_user()
    }

    /// Hide the install banner for the cooldown period.
    pub fn dismiss_install_prompt(&self) {
        self.install.dismiss();
    }

    /// Whether the install banner should be shown.
    #[must_use]
    pub fn should_offer_install(&self) -> bool {
        self.install.should_offer()
    }

    /// Activate a waiting application update.
    pub fn update_service_worker(&self) -> ActivationOutcome {
        self.worker.activate_update()
    }

    /// Follow sync status.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.coordinator.subscribe_status()
    }

    /// Follow per-mutation outcomes.
    #[must_use]
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<MutationOutcome> {
        self.coordinator.subscribe_outcomes()
    }

    /// Feed a platform connectivity event.
    pub fn handle_connectivity_event(&self, online: bool) -> bool {
        self.network.handle_platform_event(online)
    }

    /// The app came back to the foreground: re-sample connectivity and sync.
    ///
    /// The probe runs on the blocking pool since it may wait on a
    /// connection attempt.
    pub async fn on_foreground(&self) {
        self.network.resample(Arc::clone(&self.probe)).await;
        if self.config.sync.enabled && self.network.is_online() {
            drop(self.coordinator.trigger());
        }
    }

    /// Drop every cached collection, here and in the worker.
    pub fn clear_cache(&self) {
        self.cache.clear();
        self.worker.send_message(&WorkerMessage::ClearCache);
    }

    /// Current connectivity.
    #[must_use]
    pub fn connectivity(&self) -> ConnectivityState {
        self.network.current_state()
    }

    /// Latest sync status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    /// Whether cache or queue lost their storage and run from memory.
    #[must_use]
    pub fn is_memory_only(&self) -> bool {
        self.cache.is_memory_only() || self.queue.is_memory_only()
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Cache store.
    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Mutation queue.
    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Network monitor.
    #[must_use]
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Service worker controller.
    #[must_use]
    pub fn worker(&self) -> &ServiceWorkerController {
        &self.worker
    }

    /// Install prompt manager.
    #[must_use]
    pub fn install(&self) -> &InstallPromptManager {
        &self.install
    }

    /// Sync coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

impl Drop for OfflineEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sync_on_reconnect(
    mut connectivity: watch::Receiver<ConnectivityState>,
    coordinator: Weak<SyncCoordinator>,
) {
    while connectivity.changed().await.is_ok() {
        let online = connectivity.borrow_and_update().online;
        if !online {
            continue;
        }
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        tracing::debug!("Back online, syncing");
        coordinator.sync().await;
    }
}

async fn sync_on_interval(period: Duration, coordinator: Weak<SyncCoordinator>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        tracing::trace!("Periodic sync tick");
        coordinator.sync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::service_worker::tests::RecordingHost;
    use crate::domain::{MutationStatus, SyncState};
    use crate::infrastructure::durable::tests::BrokenStore;
    use crate::infrastructure::{ManualClock, MemoryRemote, WorkerTarget};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct Fixture {
        engine: OfflineEngine,
        remote: Arc<MemoryRemote>,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-04-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn quiet_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.sync.sync_on_enqueue = false;
        config.sync.interval_secs = 0;
        config.sync.grace_ms = 10;
        config.sync.retry.jitter = false;
        config
    }

    fn fixture_with(config: AppConfig, online: bool, store: Arc<dyn KeyValueStore>) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = OfflineEngine::builder(config)
            .store(store)
            .remote(remote.clone())
            .probe(Arc::new(StaticProbe(online)))
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture {
            engine,
            remote,
            clock,
        }
    }

    fn fixture(online: bool) -> Fixture {
        fixture_with(quiet_config(), online, Arc::new(MemoryKvStore::new()))
    }

    async fn wait_for_session(engine: &OfflineEngine) -> SyncStatus {
        let mut status = engine.subscribe_status();
        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.last_session.is_some() && s.state != SyncState::Syncing),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        seen
    }

    #[tokio::test]
    async fn test_offline_write_is_sent_after_reconnect() {
        let f = fixture(false);
        f.engine.start();

        let id = f
            .engine
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();
        assert!(f.engine.is_offline());
        assert_eq!(f.engine.get_sync_queue()[0].status, MutationStatus::Pending);
        assert_eq!(f.engine.status().pending, 1);

        f.engine.handle_connectivity_event(true);
        let status = wait_for_session(&f.engine).await;

        assert_eq!(status.pending, 0);
        assert!(f.engine.get_sync_queue().is_empty());
        assert_eq!(f.remote.applied_order(), vec![id]);
        assert_eq!(f.engine.get_cached_data().children()[0]["name"], "Emma");
        f.engine.shutdown();
    }

    #[tokio::test]
    async fn test_stale_cache_is_fresh_after_force_refresh() {
        let f = fixture(true);
        f.remote.seed("children", vec![json!({ "id": "c-1" })]);
        f.engine.force_refresh().await.unwrap();
        assert!(!f.engine.is_data_stale());

        f.clock.advance(chrono::Duration::hours(25));
        assert!(f.engine.is_data_stale());

        f.engine.force_refresh().await.unwrap();
        assert!(!f.engine.is_data_stale());
        assert_eq!(f.engine.cache().get("children").unwrap().fetched_at, f.clock.now());
    }

    #[tokio::test]
    async fn test_force_refresh_offline_fails() {
        let f = fixture(false);
        assert!(matches!(
            f.engine.force_refresh().await,
            Err(AppError::NetworkUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_two_triggers_in_one_tick_drain_once() {
        let f = fixture(true);
        f.engine
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();

        let first = f.engine.trigger_sync();
        let second = f.engine.trigger_sync();
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(
            results.iter().filter(|r| matches!(r, TriggerResult::Completed(_))).count(),
            1
        );
        assert_eq!(f.engine.coordinator().sessions_started(), 1);
        assert_eq!(f.remote.apply_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_write_is_surfaced_not_retried() {
        let f = fixture(true);
        let mut outcomes = f.engine.subscribe_outcomes();
        f.engine
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();
        let invalid = f
            .engine
            .enqueue_mutation("children", MutationOperation::Create, json!(42))
            .unwrap();

        f.engine.sync_with_server().await;

        assert!(matches!(outcomes.recv().await.unwrap(), MutationOutcome::Applied { .. }));
        assert_eq!(outcomes.recv().await.unwrap().id(), invalid);
        assert_eq!(f.engine.status().failed, 1);

        let calls = f.remote.apply_calls();
        f.engine.sync_with_server().await;
        assert_eq!(f.remote.apply_calls(), calls);

        f.engine.acknowledge_failure(invalid).unwrap();
        assert!(f.engine.get_sync_queue().is_empty());
        assert_eq!(f.engine.status().failed, 0);
    }

    /// Probe with a switchable answer that records where it ran.
    #[derive(Default)]
    struct SwitchProbe {
        online: std::sync::atomic::AtomicBool,
        ran_on: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ConnectivityProbe for SwitchProbe {
        fn is_online(&self) -> bool {
            self.ran_on.lock().push(std::thread::current().id());
            self.online.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_foreground_detects_reconnect_off_the_async_thread() {
        let probe = Arc::new(SwitchProbe::default());
        let remote = Arc::new(MemoryRemote::new());
        let engine = OfflineEngine::builder(quiet_config())
            .store(Arc::new(MemoryKvStore::new()))
            .remote(remote.clone())
            .probe(probe.clone())
            .build()
            .unwrap();
        assert!(engine.is_offline());
        engine
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();

        engine.on_foreground().await;
        assert!(engine.is_offline());

        probe.online.store(true, std::sync::atomic::Ordering::SeqCst);
        engine.on_foreground().await;
        assert!(!engine.is_offline());
        wait_for_session(&engine).await;
        assert_eq!(remote.collection("children").len(), 1);

        let here = std::thread::current().id();
        let ran_on = probe.ran_on.lock().clone();
        assert_eq!(ran_on.len(), 3);
        assert!(ran_on[1..].iter().all(|id| *id != here));
    }

    #[tokio::test]
    async fn test_fresh_install_writes_are_not_taken_as_replays() {
        let remote = Arc::new(MemoryRemote::new());
        let install = || {
            OfflineEngine::builder(quiet_config())
                .store(Arc::new(MemoryKvStore::new()))
                .remote(remote.clone())
                .probe(Arc::new(StaticProbe(true)))
                .build()
                .unwrap()
        };

        let first = install();
        let a = first
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();
        first.sync_with_server().await;

        // local storage wiped: queue ids start over
        let second = install();
        let b = second
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Noah" }))
            .unwrap();
        assert_eq!(a, b);
        second.sync_with_server().await;

        let children = remote.collection("children");
        let names: Vec<&str> = children.iter().filter_map(|c| c["name"].as_str()).collect();
        assert_eq!(names, vec!["Emma", "Noah"]);
        assert_eq!(second.get_cached_data().children().len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_while_online_syncs_right_away() {
        let mut config = quiet_config();
        config.sync.sync_on_enqueue = true;
        let f = fixture_with(config, true, Arc::new(MemoryKvStore::new()));

        f.engine
            .enqueue_mutation("appointments", MutationOperation::Create, json!({ "child": "c-1" }))
            .unwrap();
        wait_for_session(&f.engine).await;

        assert_eq!(f.remote.collection("appointments").len(), 1);
    }

    #[test]
    fn test_install_banner_cooldown() {
        let f = fixture(true);

        f.engine.dismiss_install_prompt();
        f.clock.set(t0() + chrono::Duration::days(7) - chrono::Duration::milliseconds(1));
        assert!(f.engine.install().is_suppressed());

        f.clock.set(t0() + chrono::Duration::days(7) + chrono::Duration::milliseconds(1));
        assert!(!f.engine.install().is_suppressed());
        // eligible again, but no platform prompt was captured
        assert_eq!(f.engine.install_app(), InstallOutcome::Unavailable);
    }

    #[test]
    fn test_upcoming_reminders_window() {
        let f = fixture(true);
        f.engine
            .cache()
            .put(
                REMINDERS,
                &json!([
                    { "id": "r-3", "due_date": "2026-04-20", "title": "MMR" },
                    { "id": "r-1", "due_date": "2026-04-03" },
                    { "id": "r-0", "due_date": "2026-03-30" },
                    { "id": "r-9", "due_date": "2026-06-01" },
                    { "id": "r-x" }
                ]),
            )
            .unwrap();

        let reminders = f.engine.get_upcoming_reminders(30);
        let ids: Vec<&str> = reminders
            .iter()
            .filter_map(|r| r.record["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["r-1", "r-3"]);
        assert_eq!(reminders[1].title(), "MMR");
    }

    #[tokio::test]
    async fn test_broken_storage_runs_memory_only() {
        let f = fixture_with(quiet_config(), true, Arc::new(BrokenStore));
        let id = f
            .engine
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();

        assert!(f.engine.is_memory_only());
        f.engine.sync_with_server().await;
        assert_eq!(f.remote.applied_order(), vec![id]);
        assert!(!f.engine.get_cached_data().collections.is_empty());
    }

    #[tokio::test]
    async fn test_worker_hears_about_sync_and_cache_clear() {
        let host = Arc::new(RecordingHost::default());
        let remote = Arc::new(MemoryRemote::new());
        let engine = OfflineEngine::builder(quiet_config())
            .store(Arc::new(MemoryKvStore::new()))
            .remote(remote)
            .probe(Arc::new(StaticProbe(true)))
            .worker_host(host.clone())
            .build()
            .unwrap();

        assert_eq!(engine.start(), RegistrationOutcome::Registered);
        engine.sync_with_server().await;
        engine.clear_cache();

        let posted = host.posted.lock().clone();
        assert_eq!(
            posted,
            vec![
                (
                    WorkerTarget::Active,
                    WorkerMessage::SyncComplete {
                        applied: 0,
                        failed: 0
                    }
                ),
                (WorkerTarget::Active, WorkerMessage::ClearCache),
            ]
        );
        assert!(engine.get_cached_data().collections.is_empty());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_worker_sync_message_triggers_drain() {
        let host = Arc::new(RecordingHost::default());
        let remote = Arc::new(MemoryRemote::new());
        let engine = OfflineEngine::builder(quiet_config())
            .store(Arc::new(MemoryKvStore::new()))
            .remote(remote.clone())
            .probe(Arc::new(StaticProbe(true)))
            .worker_host(host)
            .build()
            .unwrap();
        engine.start();
        engine
            .enqueue_mutation("children", MutationOperation::Create, json!({ "name": "Emma" }))
            .unwrap();

        engine.worker().handle_message(&WorkerMessage::SyncTriggered);
        wait_for_session(&engine).await;

        assert_eq!(remote.collection("children").len(), 1);
        engine.shutdown();
    }
}
