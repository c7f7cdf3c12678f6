mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use common::{harness, online, record, session, FakeBackend, StaticConnectivity, USER_ID};
use serde_json::json;
use shelf_core::{
    FakeClock, LocalStore, MemoryKvStore, MigrationError, MigrationProgress, MigrationStage,
    SqliteStore, SyncCoordinator, SyncSettings, SyncStatus, Table,
};
use shelf_proto::{Changeset, RawRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn recorder() -> (Arc<Mutex<Vec<MigrationProgress>>>, impl Fn(MigrationProgress) + Send + Sync) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |progress| sink.lock().unwrap().push(progress))
}

#[tokio::test]
async fn test_fresh_install_migrates_then_counts_as_migrated() {
    let h = harness();
    h.backend.seed_account();
    assert!(!h.coordinator.is_migrated().await.unwrap());
    assert!(!h.coordinator.is_ready());

    let (events, on_progress) = recorder();
    let summary = h
        .coordinator
        .start(session(), on_progress)
        .await
        .unwrap()
        .expect("first start imports");

    assert!(h.coordinator.is_migrated().await.unwrap());
    assert!(h.coordinator.is_ready());
    assert!(summary.failed_tables.is_empty());
    assert_eq!(summary.inserted.get("profiles"), Some(&1));
    assert_eq!(summary.fetched.len(), Table::ALL.len());

    let events = events.lock().unwrap();
    let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(events.first().unwrap().stage, MigrationStage::Preparing);
    assert_eq!(events.last().unwrap().stage, MigrationStage::Completed);
    assert_eq!(events.last().unwrap().progress, 100);
    drop(events);

    // Already migrated: a second start only hands over the session
    let again = h.coordinator.start(session(), |_| {}).await.unwrap();
    assert!(again.is_none());
    assert_eq!(h.status.get_status().await, SyncStatus::Success);
}

#[tokio::test]
async fn test_records_are_mapped_on_insert() {
    let h = harness();
    h.backend.seed_account();
    h.coordinator.initialize(session());
    h.coordinator.run_migration(|_| {}).await.unwrap();

    let book = h.store.find(Table::Books, "book-1").await.unwrap().unwrap();
    assert_eq!(book["api_metadata"], json!("{\"pages\":412}"));
    assert_eq!(book["created_at"], json!(1_704_153_600_000i64));
    assert_eq!(book["title"], json!("Dune"));
    // Imported rows are already on the backend
    assert!(h.store.pending_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_single_table_failure_does_not_abort() {
    let h = harness();
    h.backend.seed_account();
    h.backend.fail_table(Table::Achievements);
    h.coordinator.initialize(session());

    let summary = h.coordinator.run_migration(|_| {}).await.unwrap();

    assert_eq!(summary.failed_tables, vec!["achievements"]);
    assert_eq!(summary.fetched.get("achievements"), Some(&0));
    let fetched = h.backend.fetched_tables.lock().unwrap().clone();
    assert_eq!(fetched, Table::ALL.to_vec());
    assert_eq!(h.store.count(Table::Books).await.unwrap(), 1);

    let validation = h.coordinator.validate_migration().await;
    assert!(!validation.is_valid);
    assert_eq!(validation.issues.len(), 1);
    assert!(validation.issues[0].contains("Achievement"));
}

#[tokio::test]
async fn test_validation_passes_for_complete_import() {
    let h = harness();
    h.backend.seed_account();
    h.coordinator.initialize(session());
    h.coordinator.run_migration(|_| {}).await.unwrap();

    let validation = h.coordinator.validate_migration().await;
    assert!(validation.is_valid, "{:?}", validation.issues);
}

#[tokio::test]
async fn test_missing_session_is_fatal() {
    let h = harness();
    let (events, on_progress) = recorder();

    let err = h.coordinator.run_migration(on_progress).await.unwrap_err();

    assert!(matches!(err, MigrationError::NoSession));
    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.stage, MigrationStage::Error);
    assert_eq!(last.progress, 0);
    assert!(last.error.is_some());
}

#[tokio::test]
async fn test_unreachable_backend_is_fatal() {
    let h = harness();
    for table in Table::ALL {
        h.backend.fail_table(table);
    }
    h.coordinator.initialize(session());
    let (events, on_progress) = recorder();

    let err = h.coordinator.run_migration(on_progress).await.unwrap_err();

    assert!(matches!(err, MigrationError::Unreachable(_)));
    assert_eq!(events.lock().unwrap().last().unwrap().stage, MigrationStage::Error);
    assert!(!h.coordinator.is_migrated().await.unwrap());
}

#[tokio::test]
async fn test_migration_replaces_existing_local_state() {
    let h = harness();
    h.backend.seed_account();
    h.store
        .create(Table::Books, record(json!({"id": "stale", "user_id": USER_ID})))
        .await
        .unwrap();
    h.store.set_last_pulled_at(99).await.unwrap();
    h.status.set_error("previous attempt failed").await;
    h.coordinator.initialize(session());

    h.coordinator.run_migration(|_| {}).await.unwrap();

    assert!(h.store.find(Table::Books, "stale").await.unwrap().is_none());
    assert_eq!(h.store.last_pulled_at().await.unwrap(), None);
    let info = h.coordinator.status().await;
    assert_eq!(info.status, SyncStatus::Success);
    assert_eq!(info.last_error, None);
}

#[tokio::test]
async fn test_failed_insert_skips_only_that_table() {
    let h = harness();
    h.backend.seed_account();
    h.backend.set_table(
        Table::Books,
        vec![
            record(json!({"id": "book-1", "title": "Dune"})),
            record(json!({"title": "No id"})),
        ],
    );
    h.coordinator.initialize(session());

    let summary = h.coordinator.run_migration(|_| {}).await.unwrap();

    assert_eq!(summary.failed_tables, vec!["books"]);
    assert_eq!(summary.fetched.get("books"), Some(&2));
    assert_eq!(summary.inserted.get("books"), None);
    assert_eq!(summary.inserted.get("profiles"), Some(&1));
    assert_eq!(summary.inserted.get("achievements"), Some(&1));
    // The batch is one transaction, so the valid book is not kept either
    assert_eq!(h.store.count(Table::Books).await.unwrap(), 0);
    assert!(h.coordinator.is_migrated().await.unwrap());
    assert!(h.coordinator.is_ready());
}

/// SQLite store whose first `count` fails, like a briefly locked database
struct FlakyStore {
    inner: SqliteStore,
    failed: AtomicBool,
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn fetch_all(&self, table: Table) -> Result<Vec<RawRecord>> {
        self.inner.fetch_all(table).await
    }

    async fn count(&self, table: Table) -> Result<usize> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner.count(table).await
    }

    async fn find(&self, table: Table, id: &str) -> Result<Option<RawRecord>> {
        self.inner.find(table, id).await
    }

    async fn bulk_create(&self, table: Table, records: Vec<RawRecord>) -> Result<usize> {
        self.inner.bulk_create(table, records).await
    }

    async fn create(&self, table: Table, record: RawRecord) -> Result<String> {
        self.inner.create(table, record).await
    }

    async fn update(&self, table: Table, id: &str, fields: RawRecord) -> Result<()> {
        self.inner.update(table, id, fields).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        self.inner.delete(table, id).await
    }

    async fn apply_remote_changes(&self, changes: &Changeset) -> Result<usize> {
        self.inner.apply_remote_changes(changes).await
    }

    async fn pending_changes(&self) -> Result<Changeset> {
        self.inner.pending_changes().await
    }

    async fn mark_synced(&self, changes: &Changeset) -> Result<()> {
        self.inner.mark_synced(changes).await
    }

    async fn last_pulled_at(&self) -> Result<Option<i64>> {
        self.inner.last_pulled_at().await
    }

    async fn set_last_pulled_at(&self, timestamp: i64) -> Result<()> {
        self.inner.set_last_pulled_at(timestamp).await
    }

    async fn clear_last_pulled_at(&self) -> Result<()> {
        self.inner.clear_last_pulled_at().await
    }

    async fn reset(&self) -> Result<()> {
        self.inner.reset().await
    }
}

#[tokio::test]
async fn test_unreadable_store_does_not_trigger_import() {
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        failed: AtomicBool::new(false),
    });
    store
        .inner
        .bulk_create(Table::Profiles, vec![record(json!({"id": USER_ID}))])
        .await
        .unwrap();
    store
        .inner
        .create(Table::Books, record(json!({"id": "offline-edit", "title": "Draft"})))
        .await
        .unwrap();
    let backend = FakeBackend::new();
    backend.seed_account();
    let coordinator = SyncCoordinator::new(
        store.clone(),
        Arc::new(MemoryKvStore::new()),
        backend.clone(),
        Arc::new(StaticConnectivity(online())),
        Arc::new(FakeClock::default()),
        &SyncSettings::default(),
    );

    let err = coordinator.start(session(), |_| {}).await.unwrap_err();

    assert!(matches!(err, MigrationError::Store(_)));
    assert!(backend.fetched_tables.lock().unwrap().is_empty());
    assert!(store
        .inner
        .find(Table::Books, "offline-edit")
        .await
        .unwrap()
        .is_some());
    assert_eq!(store.inner.pending_changes().await.unwrap().record_count(), 1);
}
