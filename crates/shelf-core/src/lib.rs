pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod kv;
pub mod migration;
pub mod network;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod store;
pub mod tables;

// Re-export commonly used types
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{Config, State, SyncSettings};
pub use engine::{SyncEngine, SyncResult, SyncTrigger};
pub use error::{MigrationError, SyncError};
pub use facade::SyncCoordinator;
pub use kv::{KeyValueStore, MemoryKvStore, SqliteKvStore};
pub use migration::{MigrationImporter, MigrationProgress, MigrationStage, MigrationSummary};
pub use network::{ConnectivitySource, ConnectivityState, NetworkMonitor, NetworkStatus};
pub use remote::{HttpBackend, RemoteBackend, RemoteError};
pub use session::Session;
pub use status::{SyncStatus, SyncStatusRecord, SyncStatusStore};
pub use store::{LocalStore, SqliteStore};
pub use tables::Table;
