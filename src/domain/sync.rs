//! Sync-related domain models and configuration.
//!
//! Contains the engine configuration, the coordinator's state machine
//! states, per-session bookkeeping, and the events published to the UI.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::RejectionKind;
use super::models::{FetchScope, QueuedMutation};

/// Configuration for the local snapshot cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Age in hours after which cached data is reported stale.
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,

    /// Collections refreshed after every drain.
    #[serde(default = "default_tracked_collections")]
    pub tracked_collections: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: default_stale_after_hours(),
            tracked_collections: default_tracked_collections(),
        }
    }
}

const fn default_stale_after_hours() -> u64 {
    24
}

fn default_tracked_collections() -> Vec<String> {
    ["children", "appointments", "vaccinations", "reminders"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Backoff settings for retrying after network failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

const fn default_initial_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    300_000 // 5 minutes
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_jitter() -> bool {
    true
}

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether automatic sync triggers are enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Interval between foreground sync ticks in seconds (0 disables).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Attempt a sync right after a mutation is queued while online.
    #[serde(default = "default_enabled")]
    pub sync_on_enqueue: bool,

    /// Sync when connectivity returns.
    #[serde(default = "default_enabled")]
    pub sync_on_reconnect: bool,

    /// How long the coordinator reports `Synced` before returning to idle.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Timeout for each remote request in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retry backoff after network failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval(),
            sync_on_enqueue: default_enabled(),
            sync_on_reconnect: default_enabled(),
            grace_ms: default_grace_ms(),
            request_timeout_secs: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

const fn default_interval() -> u64 {
    300 // 5 minutes
}

const fn default_enabled() -> bool {
    true
}

const fn default_grace_ms() -> u64 {
    2_000
}

const fn default_request_timeout() -> u64 {
    15
}

/// Configuration for the install prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Days the install banner stays hidden after a dismissal.
    #[serde(default = "default_dismiss_cooldown_days")]
    pub dismiss_cooldown_days: u32,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            dismiss_cooldown_days: default_dismiss_cooldown_days(),
        }
    }
}

const fn default_dismiss_cooldown_days() -> u32 {
    7
}

/// Remote backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the hosted backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Scope applied to every collection fetch.
    #[serde(default)]
    pub scope: FetchScope,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            scope: FetchScope::default(),
        }
    }
}

fn default_api_key_env() -> String {
    "CLINIC_API_KEY".to_string()
}

/// Path configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathConfig {
    /// Base data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Snapshot cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sync coordinator configuration.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Install prompt configuration.
    #[serde(default)]
    pub install: InstallConfig,

    /// Remote backend configuration.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Path configuration.
    #[serde(default)]
    pub paths: PathConfig,
}

impl AppConfig {
    /// Get the data directory, using default if not configured.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.paths
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clinic-offline")
    }

    /// Get the storage database path.
    #[must_use]
    pub fn storage_db_path(&self) -> PathBuf {
        self.data_dir().join("offline.db")
    }

    /// Get the config file path.
    #[must_use]
    pub fn config_file_path(&self) -> PathBuf {
        self.data_dir().join("config.toml")
    }

    /// Staleness threshold for cached collections.
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        i64::try_from(self.cache.stale_after_hours)
            .ok()
            .and_then(Duration::try_hours)
            .unwrap_or(Duration::MAX)
    }

    /// Cooldown after the install banner is dismissed.
    #[must_use]
    pub fn dismiss_cooldown(&self) -> Duration {
        Duration::days(i64::from(self.install.dismiss_cooldown_days))
    }

    /// Grace window between `Synced` and `Idle`.
    #[must_use]
    pub const fn grace_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sync.grace_ms)
    }
}

/// State of the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Waiting for a trigger.
    Idle,
    /// A session is draining the queue or refreshing the cache.
    Syncing,
    /// The last session completed; shown briefly before returning to idle.
    Synced,
    /// The last session stopped on a network failure; a retry is scheduled.
    Error,
}

impl SyncState {
    /// Returns true if a new session may start.
    #[must_use]
    pub const fn can_start_sync(self) -> bool {
        !matches!(self, Self::Syncing)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// How a sync session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// Queue drained and cache refreshed.
    Synced,
    /// Stopped on a network failure; remaining work stays queued.
    Error,
    /// Drained and refreshed, but some mutations were rejected.
    Partial,
}

/// One drain attempt. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session finished.
    pub ended_at: Option<DateTime<Utc>>,
    /// How the session ended.
    pub outcome: SyncOutcome,
    /// Mutations accepted by the server.
    pub applied_count: usize,
    /// Mutations rejected by the server.
    pub failed_count: usize,
    /// Collections refreshed into the cache.
    #[serde(default)]
    pub refreshed: Vec<String>,
    /// Error that stopped the session, if any.
    #[serde(default)]
    pub error: Option<String>,
}

impl SyncSession {
    /// Start a new session.
    #[must_use]
    pub const fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ended_at: None,
            outcome: SyncOutcome::Synced,
            applied_count: 0,
            failed_count: 0,
            refreshed: Vec::new(),
            error: None,
        }
    }

    /// Finish the session; the outcome follows from the counts and error.
    #[must_use]
    pub fn finish(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = Some(ended_at);
        self.outcome = if self.error.is_some() {
            SyncOutcome::Error
        } else if self.failed_count > 0 {
            SyncOutcome::Partial
        } else {
            SyncOutcome::Synced
        };
        self
    }

    /// Set error state.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Snapshot of coordinator status for UI indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Current state machine state.
    pub state: SyncState,
    /// Most recent finished session.
    pub last_session: Option<SyncSession>,
    /// Mutations waiting to be sent.
    pub pending: usize,
    /// Rejected mutations awaiting acknowledgement.
    pub failed: usize,
    /// When the scheduled retry fires, if one is pending.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_session: None,
            pending: 0,
            failed: 0,
            next_retry_at: None,
        }
    }
}

/// Result of submitting one mutation, published to the initiating flow.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server accepted the mutation; it left the queue.
    Applied {
        /// Queue id of the mutation.
        id: u64,
        /// Resource collection it targeted.
        resource_type: String,
    },
    /// The server refused the mutation; it stays listed as failed.
    Rejected {
        /// The failed entry as recorded in the queue.
        mutation: QueuedMutation,
        /// Rejection class.
        kind: RejectionKind,
        /// Server message.
        message: String,
    },
}

impl MutationOutcome {
    /// Queue id the outcome refers to.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Applied { id, .. } => *id,
            Self::Rejected { mutation, .. } => mutation.id,
        }
    }
}

/// Why a sync trigger did or did not start a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResult {
    /// A session ran to completion.
    Completed(SyncSession),
    /// Another session was already active.
    AlreadySyncing,
    /// The device is offline; nothing was attempted.
    Offline,
}
