//! Domain layer - core types shared by every component.
//!
//! This layer contains pure domain models, configuration and error types
//! without any external dependencies (DB, IO, network).

pub mod error;
pub mod models;
pub mod sync;

pub use error::{AppError, RejectionKind, RemoteError, Result};
pub use models::{
    CachedData, CachedEntity, ConnectivityState, FetchScope, InstallPromptState,
    MutationOperation, MutationStatus, QueuedMutation, Reminder, CHILDREN, REMINDERS,
};
pub use sync::{
    AppConfig, CacheConfig, InstallConfig, MutationOutcome, RemoteConfig, RetryConfig,
    SyncConfig, SyncOutcome, SyncSession, SyncState, SyncStatus, TriggerResult,
};
