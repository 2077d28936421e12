//! Application layer - the offline components and their orchestration.
//!
//! The engine owns one of each component and exposes the operations the
//! UI calls; the coordinator is the only part that talks to the backend.

pub mod backoff;
pub mod cache_store;
pub mod engine;
pub mod formatter;
pub mod install_prompt;
pub mod mutation_queue;
pub mod network_monitor;
pub mod observers;
pub mod service_worker;
pub mod sync_coordinator;

pub use backoff::{delay_for_attempt, Backoff};
pub use cache_store::CacheStore;
pub use engine::{EngineBuilder, OfflineEngine};
pub use formatter::{
    format_cache_table, format_queue_table, format_reminders_table, format_status, OutputFormat,
};
pub use install_prompt::{InstallOutcome, InstallPromptManager};
pub use mutation_queue::MutationQueue;
pub use network_monitor::NetworkMonitor;
pub use observers::{ObserverSet, Subscription};
pub use service_worker::{ActivationOutcome, RegistrationOutcome, ServiceWorkerController};
pub use sync_coordinator::{CoordinatorSettings, SyncCoordinator};
