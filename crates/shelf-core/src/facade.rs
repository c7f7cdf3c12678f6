//! Composition root tying the status store, connectivity monitor, migration
//! importer and sync engine together for the application layer.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::engine::{SyncEngine, SyncResult};
use crate::error::{MigrationError, SyncError};
use crate::kv::KeyValueStore;
use crate::migration::{MigrationImporter, MigrationProgress, MigrationSummary, MigrationValidation};
use crate::network::{ConnectivitySource, NetworkMonitor, NetworkStatus};
use crate::remote::RemoteBackend;
use crate::session::Session;
use crate::status::{SyncStatusRecord, SyncStatusStore};
use crate::store::LocalStore;
use crate::tables::Table;

pub struct SyncCoordinator {
    store: Arc<dyn LocalStore>,
    status: Arc<SyncStatusStore>,
    engine: Arc<SyncEngine>,
    importer: MigrationImporter,
    monitor: Arc<NetworkMonitor>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Arc<dyn ConnectivitySource>,
        clock: Arc<dyn Clock>,
        settings: &SyncSettings,
    ) -> Self {
        let status = Arc::new(SyncStatusStore::new(kv, Arc::clone(&clock)));
        let mut engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&status),
            clock,
            settings.schema_version,
        );
        if let Some(ref migration) = settings.migration {
            engine = engine.with_migration(migration.clone());
        }
        let engine = Arc::new(engine);
        let importer = MigrationImporter::new(
            Arc::clone(&store),
            remote,
            Arc::clone(&status),
            Arc::clone(&engine),
        );
        let monitor = NetworkMonitor::new(connectivity, Arc::clone(&status), engine.clone())
            .with_stabilization_delay(settings.stabilization_delay());
        monitor.set_auto_sync_enabled(settings.auto_sync);
        monitor.set_auto_sync_interval(settings.auto_sync_interval());

        Self {
            store,
            status,
            engine,
            importer,
            monitor: Arc::new(monitor),
        }
    }

    /// Hand the session to both engines. Use [`SyncCoordinator::start`] when the
    /// local store may still need its initial import.
    pub fn initialize(&self, session: Session) {
        self.importer.initialize(session.clone());
        self.engine.initialize(session);
    }

    /// Bring the layer up for a signed-in user: seed the connectivity status and
    /// run the one-time import if this device has no data yet. The sync engine
    /// only receives the session once local data exists.
    pub async fn start<F>(
        &self,
        session: Session,
        on_progress: F,
    ) -> Result<Option<MigrationSummary>, MigrationError>
    where
        F: Fn(MigrationProgress) + Send + Sync,
    {
        if let Err(e) = self.monitor.initialize().await {
            warn!(error = %format!("{e:#}"), "could not read initial connectivity");
        }

        self.importer.initialize(session.clone());
        // Importing wipes the store, so an unreadable one must not look empty
        let migrated = self.is_migrated().await.map_err(MigrationError::Store)?;
        if migrated {
            self.engine.initialize(session);
            return Ok(None);
        }

        info!("no local profile found, running initial import");
        self.importer.migrate(on_progress).await.map(Some)
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_ready()
    }

    /// True once at least one profile row exists locally.
    pub async fn is_migrated(&self) -> Result<bool> {
        Ok(self.store.count(Table::Profiles).await? > 0)
    }

    pub async fn run_migration<F>(&self, on_progress: F) -> Result<MigrationSummary, MigrationError>
    where
        F: Fn(MigrationProgress) + Send + Sync,
    {
        self.importer.migrate(on_progress).await
    }

    pub async fn validate_migration(&self) -> MigrationValidation {
        self.importer.validate_migration().await
    }

    /// Background-style round: failures are reported in the result and status.
    pub async fn sync(&self) -> Result<SyncResult, SyncError> {
        self.engine.sync_database().await
    }

    /// Manual "sync now": a failed round comes back as an error.
    pub async fn sync_now(&self) -> Result<SyncResult, SyncError> {
        self.engine.sync_now().await
    }

    pub async fn force_full_resync(&self) -> Result<SyncResult, SyncError> {
        self.engine.force_sync_database().await
    }

    pub fn is_currently_syncing(&self) -> bool {
        self.engine.is_currently_syncing()
    }

    pub async fn status(&self) -> SyncStatusRecord {
        self.status.get_sync_status_info().await
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.monitor.get_current_status()
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn status_store(&self) -> &Arc<SyncStatusStore> {
        &self.status
    }

    /// Drop the session from both engines, e.g. on sign-out
    pub fn sign_out(&self) {
        self.engine.reset_session();
        self.importer.reset_session();
    }
}
