//! Steady-state pull-then-push reconciliation against the backend change log.
//!
//! A round pulls everything since the local checkpoint, applies it, then pushes
//! the local pending-change ledger tagged with the checkpoint it just pulled.
//! The checkpoint only advances once both halves succeed, so a failed round can
//! always be retried safely. At most one round runs at a time.

use async_trait::async_trait;
use serde::Serialize;
use shelf_proto::{Changeset, PullRequest, PushRequest, TableChanges};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::remote::{RemoteBackend, RemoteError};
use crate::session::Session;
use crate::status::{SyncStatus, SyncStatusStore};
use crate::store::LocalStore;
use crate::tables::Table;

/// Outcome of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    /// Records received from the backend
    pub pulled: usize,
    /// Local records acknowledged by the backend
    pub pushed: usize,
    /// Epoch milliseconds when the round ended
    pub completed_at: i64,
    pub error: Option<String>,
}

/// Something that can run a sync round on request. Round failures are errors.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn trigger_sync(&self) -> Result<SyncResult, SyncError>;
}

struct RoundCounts {
    pulled: usize,
    pushed: usize,
}

/// Clears the in-flight flag when a round ends, however it ends
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    status: Arc<SyncStatusStore>,
    clock: Arc<dyn Clock>,
    schema_version: u32,
    migration: Option<serde_json::Value>,
    session: RwLock<Option<Session>>,
    syncing: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        status: Arc<SyncStatusStore>,
        clock: Arc<dyn Clock>,
        schema_version: u32,
    ) -> Self {
        Self {
            store,
            remote,
            status,
            clock,
            schema_version,
            migration: None,
            session: RwLock::new(None),
            syncing: AtomicBool::new(false),
        }
    }

    /// Local schema migration info forwarded with every pull
    pub fn with_migration(mut self, migration: serde_json::Value) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Bind the authenticated session; rounds fail with `NotInitialized` until then.
    pub fn initialize(&self, session: Session) {
        info!(user_id = session.user_id(), "sync engine initialized");
        match self.session.write() {
            Ok(mut slot) => *slot = Some(session),
            Err(poisoned) => *poisoned.into_inner() = Some(session),
        }
    }

    /// Forget the session, e.g. on sign-out
    pub fn reset_session(&self) {
        match self.session.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.session().is_ok()
    }

    pub fn is_currently_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    fn session(&self) -> Result<Session, SyncError> {
        let slot = match self.session.read() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone().ok_or(SyncError::NotInitialized)
    }

    fn begin_flight(&self) -> Result<FlightGuard<'_>, SyncError> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadySyncing)?;
        Ok(FlightGuard {
            flag: &self.syncing,
        })
    }

    /// Run one round. Precondition failures (`NotInitialized`, `AlreadySyncing`)
    /// are errors and leave the status untouched; a failed round is reported in
    /// the returned result and in the status store.
    pub async fn sync_database(&self) -> Result<SyncResult, SyncError> {
        let session = self.session()?;
        let _flight = self.begin_flight()?;
        Ok(self.run_round(&session).await)
    }

    /// Drop the checkpoint and run a round, re-pulling the complete dataset.
    pub async fn force_sync_database(&self) -> Result<SyncResult, SyncError> {
        let session = self.session()?;
        let _flight = self.begin_flight()?;
        info!("clearing sync checkpoint for a full resync");
        self.store.clear_last_pulled_at().await?;
        Ok(self.run_round(&session).await)
    }

    /// Manual "sync now": a failed round is returned as an error so the caller
    /// can show it right away.
    pub async fn sync_now(&self) -> Result<SyncResult, SyncError> {
        let result = self.sync_database().await?;
        if result.success {
            Ok(result)
        } else {
            Err(SyncError::RoundFailed(result.error.unwrap_or_default()))
        }
    }

    async fn run_round(&self, session: &Session) -> SyncResult {
        self.status.set_status(SyncStatus::Syncing).await;
        match self.pull_then_push(session).await {
            Ok(counts) => {
                self.status.set_status(SyncStatus::Success).await;
                info!(pulled = counts.pulled, pushed = counts.pushed, "sync round complete");
                SyncResult {
                    success: true,
                    pulled: counts.pulled,
                    pushed: counts.pushed,
                    completed_at: self.clock.now_ms(),
                    error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "sync round failed");
                self.status.set_error(&message).await;
                SyncResult {
                    success: false,
                    pulled: 0,
                    pushed: 0,
                    completed_at: self.clock.now_ms(),
                    error: Some(message),
                }
            }
        }
    }

    async fn pull_then_push(&self, session: &Session) -> Result<RoundCounts, SyncError> {
        let checkpoint = self.store.last_pulled_at().await?;
        debug!(?checkpoint, "starting pull");

        let response = self
            .remote
            .pull_changes(
                session,
                PullRequest {
                    last_pulled_at: checkpoint.unwrap_or(0),
                    schema_version: self.schema_version,
                    migration: self.migration.clone(),
                    user_id: session.user_id().to_string(),
                },
            )
            .await
            .map_err(SyncError::Pull)?;

        let pulled = response.changes.record_count();
        let changes = map_pulled_changes(response.changes);
        self.store.apply_remote_changes(&changes).await?;

        let local = self.store.pending_changes().await?;
        let pushed = local.record_count();
        if local.is_empty() {
            debug!("no local changes to push");
        } else {
            let request = PushRequest {
                changes: local.clone(),
                last_pulled_at: response.timestamp,
                user_id: session.user_id().to_string(),
            };
            match self.remote.push_changes(session, request).await {
                Ok(_) => {}
                Err(RemoteError::Conflict(message)) => {
                    warn!(%message, "push rejected as conflicting");
                    return Err(SyncError::PushConflict(message));
                }
                Err(e) => return Err(SyncError::Push(e)),
            }
            self.store.mark_synced(&local).await?;
        }

        self.store.set_last_pulled_at(response.timestamp).await?;
        Ok(RoundCounts { pulled, pushed })
    }
}

/// Run pulled records through the table registry; unknown tables pass through
/// and are skipped by the store.
fn map_pulled_changes(changes: Changeset) -> Changeset {
    let mapped = changes
        .0
        .into_iter()
        .map(|(name, table_changes)| match name.parse::<Table>() {
            Ok(table) => {
                let mapped = TableChanges {
                    created: table_changes
                        .created
                        .into_iter()
                        .map(|r| table.map_record(r))
                        .collect(),
                    updated: table_changes
                        .updated
                        .into_iter()
                        .map(|r| table.map_record(r))
                        .collect(),
                    deleted: table_changes.deleted,
                };
                (name, mapped)
            }
            Err(_) => (name, table_changes),
        })
        .collect();
    Changeset(mapped)
}

#[async_trait]
impl SyncTrigger for SyncEngine {
    async fn trigger_sync(&self) -> Result<SyncResult, SyncError> {
        self.sync_now().await
    }
}
