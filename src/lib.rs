//! Clinic Offline - offline-first data layer for the clinic parent portal.
//!
//! Keeps the last server data in a durable cache, queues writes made while
//! offline, and replays them in order once the connection returns.
//!
//! ```no_run
//! use clinic_offline::{AppConfig, OfflineEngine};
//!
//! # async fn demo() -> clinic_offline::Result<()> {
//! let engine = OfflineEngine::builder(AppConfig::default()).build()?;
//! engine.start();
//! if engine.is_data_stale() && !engine.is_offline() {
//!     engine.force_refresh().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{
    ActivationOutcome, InstallOutcome, OfflineEngine, RegistrationOutcome, Subscription,
};
pub use domain::{
    AppConfig, AppError, CachedData, CachedEntity, MutationOperation, MutationOutcome,
    QueuedMutation, Reminder, Result, SyncState, SyncStatus, TriggerResult,
};
