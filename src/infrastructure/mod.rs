//! Infrastructure layer - external adapters (storage, network, platform).
//!
//! This layer handles all I/O operations and external dependencies.

pub mod clock;
pub mod config;
pub mod durable;
pub mod kv_store;
pub mod platform;
pub mod remote;
pub mod rest_remote;
pub mod schema;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ensure_config_exists, load_config, load_config_from_file, save_config};
pub use durable::DurableWriter;
pub use kv_store::{KeyValueStore, MemoryKvStore, SqliteKvStore, WriteOp};
pub use platform::{
    ConnectivityProbe, DeferredPrompt, HeadlessWorkerHost, MessageKind, PromptOutcome,
    StaticProbe, TcpProbe, WorkerHost, WorkerLifecycle, WorkerMessage, WorkerTarget,
};
pub use remote::{MemoryRemote, RemoteClient, RemoteResult};
pub use rest_remote::RestRemoteClient;
