//! One-time import of a user's complete remote dataset into an empty local store.

use serde::Serialize;
use shelf_proto::RawRecord;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::engine::SyncEngine;
use crate::error::MigrationError;
use crate::remote::RemoteBackend;
use crate::session::Session;
use crate::status::{SyncStatus, SyncStatusStore};
use crate::store::LocalStore;
use crate::tables::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStage {
    Preparing,
    Fetching,
    Inserting,
    Finalizing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub stage: MigrationStage,
    /// 0 to 100
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
}

impl MigrationProgress {
    fn new(stage: MigrationStage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress,
            message: message.into(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub fetched: BTreeMap<&'static str, usize>,
    pub inserted: BTreeMap<&'static str, usize>,
    pub failed_tables: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

pub struct MigrationImporter {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    status: Arc<SyncStatusStore>,
    engine: Arc<SyncEngine>,
    session: RwLock<Option<Session>>,
}

fn scale(start: u8, span: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return start + span;
    }
    start + (span as usize * done / total) as u8
}

impl MigrationImporter {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        status: Arc<SyncStatusStore>,
        engine: Arc<SyncEngine>,
    ) -> Self {
        Self {
            store,
            remote,
            status,
            engine,
            session: RwLock::new(None),
        }
    }

    pub fn initialize(&self, session: Session) {
        match self.session.write() {
            Ok(mut slot) => *slot = Some(session),
            Err(poisoned) => *poisoned.into_inner() = Some(session),
        }
    }

    pub fn reset_session(&self) {
        match self.session.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn session(&self) -> Option<Session> {
        match self.session.read() {
            Ok(slot) => (*slot).clone(),
            Err(poisoned) => (*poisoned.into_inner()).clone(),
        }
    }

    /// Wipe the local store and import every table. Single-table failures are
    /// logged and recorded in the summary; only failures that mean nothing
    /// was imported at all are returned as errors.
    pub async fn migrate<F>(&self, on_progress: F) -> Result<MigrationSummary, MigrationError>
    where
        F: Fn(MigrationProgress) + Send + Sync,
    {
        match self.run(&on_progress).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, "migration failed");
                on_progress(MigrationProgress {
                    stage: MigrationStage::Error,
                    progress: 0,
                    message: "Migration failed".to_string(),
                    error: Some(reason),
                });
                Err(e)
            }
        }
    }

    async fn run<F>(&self, on_progress: &F) -> Result<MigrationSummary, MigrationError>
    where
        F: Fn(MigrationProgress) + Send + Sync,
    {
        let session = self.session().ok_or(MigrationError::NoSession)?;
        info!(user_id = session.user_id(), "starting migration");

        on_progress(MigrationProgress::new(
            MigrationStage::Preparing,
            0,
            "Preparing local database",
        ));
        self.store.reset().await.map_err(MigrationError::Reset)?;
        self.status.clear_sync_data().await;

        let mut summary = MigrationSummary::default();
        let fetched = self.fetch_all(&session, &mut summary, on_progress).await?;
        self.insert_all(fetched, &mut summary, on_progress).await;

        on_progress(MigrationProgress::new(
            MigrationStage::Finalizing,
            90,
            "Finalizing",
        ));
        self.status.set_status(SyncStatus::Success).await;
        self.engine.initialize(session);

        on_progress(MigrationProgress::new(
            MigrationStage::Completed,
            100,
            "Migration complete",
        ));
        info!(
            tables = summary.inserted.len(),
            failed = summary.failed_tables.len(),
            "migration complete"
        );
        Ok(summary)
    }

    async fn fetch_all<F>(
        &self,
        session: &Session,
        summary: &mut MigrationSummary,
        on_progress: &F,
    ) -> Result<Vec<(Table, Vec<RawRecord>)>, MigrationError>
    where
        F: Fn(MigrationProgress) + Send + Sync,
    {
        on_progress(MigrationProgress::new(
            MigrationStage::Fetching,
            20,
            "Fetching data from server",
        ));

        let total = Table::ALL.len();
        let mut fetched = Vec::with_capacity(total);
        let mut last_failure = None;
        for (i, table) in Table::ALL.into_iter().enumerate() {
            let rows = match self
                .remote
                .fetch_table(session, table, Some(session.user_id()))
                .await
            {
                Ok(rows) => {
                    debug!(table = table.name(), rows = rows.len(), "fetched table");
                    rows
                }
                Err(e) => {
                    warn!(table = table.name(), error = %e, "failed to fetch table, continuing");
                    summary.failed_tables.push(table.name());
                    last_failure = Some(e.to_string());
                    Vec::new()
                }
            };
            summary.fetched.insert(table.name(), rows.len());
            fetched.push((table, rows));

            on_progress(MigrationProgress::new(
                MigrationStage::Fetching,
                scale(20, 40, i + 1, total),
                format!("Fetched {}", table.name()),
            ));
        }

        if summary.failed_tables.len() == total {
            return Err(MigrationError::Unreachable(last_failure.unwrap_or_default()));
        }
        Ok(fetched)
    }

    async fn insert_all<F>(
        &self,
        fetched: Vec<(Table, Vec<RawRecord>)>,
        summary: &mut MigrationSummary,
        on_progress: &F,
    ) where
        F: Fn(MigrationProgress) + Send + Sync,
    {
        on_progress(MigrationProgress::new(
            MigrationStage::Inserting,
            60,
            "Saving data locally",
        ));

        let total = fetched.len();
        for (i, (table, rows)) in fetched.into_iter().enumerate() {
            if !rows.is_empty() {
                let records: Vec<RawRecord> =
                    rows.into_iter().map(|r| table.map_record(r)).collect();
                match self.store.bulk_create(table, records).await {
                    Ok(count) => {
                        debug!(table = table.name(), count, "inserted records");
                        summary.inserted.insert(table.name(), count);
                    }
                    Err(e) => {
                        warn!(
                            table = table.name(),
                            error = %format!("{e:#}"),
                            "failed to insert table, continuing"
                        );
                        if !summary.failed_tables.contains(&table.name()) {
                            summary.failed_tables.push(table.name());
                        }
                    }
                }
            }

            on_progress(MigrationProgress::new(
                MigrationStage::Inserting,
                scale(60, 30, i + 1, total),
                format!("Saved {}", table.name()),
            ));
        }
    }

    /// Advisory check of the imported data. Never fails; problems, including
    /// store errors, are reported as issues.
    pub async fn validate_migration(&self) -> MigrationValidation {
        let mut issues = Vec::new();

        let profile = match self.session() {
            Some(session) => self
                .store
                .find(Table::Profiles, session.user_id())
                .await
                .map(|found| found.is_some()),
            None => self.store.count(Table::Profiles).await.map(|n| n > 0),
        };
        match profile {
            Ok(true) => {}
            Ok(false) => issues.push("No user profile found locally".to_string()),
            Err(e) => issues.push(format!("Failed to read profiles: {e:#}")),
        }

        match self.store.count(Table::Achievements).await {
            Ok(0) => issues.push("Achievement catalog is empty".to_string()),
            Ok(_) => {}
            Err(e) => issues.push(format!("Failed to read achievements: {e:#}")),
        }

        if !issues.is_empty() {
            warn!(?issues, "migration validation found issues");
        }
        MigrationValidation {
            is_valid: issues.is_empty(),
            issues,
        }
    }
}
