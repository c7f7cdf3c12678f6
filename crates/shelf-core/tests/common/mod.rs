#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use shelf_core::{
    Clock, ConnectivitySource, ConnectivityState, FakeClock, LocalStore, MemoryKvStore,
    RemoteBackend, RemoteError, Session, SqliteStore, SyncCoordinator, SyncSettings,
    SyncStatusStore, Table,
};
use shelf_proto::{
    Changeset, PullRequest, PullResponse, PushRequest, PushResponse, RawRecord,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const USER_ID: &str = "user-1";

pub fn session() -> Session {
    Session::new(USER_ID, "token-1")
}

pub fn record(value: Value) -> RawRecord {
    value.as_object().cloned().expect("record must be a JSON object")
}

/// In-memory backend with call counters and failure switches.
#[derive(Default)]
pub struct FakeBackend {
    pub pull_calls: AtomicUsize,
    pub push_calls: AtomicUsize,
    pub fail_pull: AtomicBool,
    pub fail_push: AtomicBool,
    pub conflict_push: AtomicBool,
    pub pull_requests: Mutex<Vec<PullRequest>>,
    pub push_requests: Mutex<Vec<PushRequest>>,
    pub pull_response: Mutex<PullResponse>,
    pub tables: Mutex<HashMap<Table, Vec<RawRecord>>>,
    pub failing_tables: Mutex<HashSet<Table>>,
    pub fetched_tables: Mutex<Vec<Table>>,
    /// When set, pulls signal `pull_entered` and wait for `release_pull`
    pub block_pull: AtomicBool,
    pub pull_entered: Notify,
    pub release_pull: Notify,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_pull_response(&self, changes: Changeset, timestamp: i64) {
        *self.pull_response.lock().unwrap() = PullResponse { changes, timestamp };
    }

    pub fn set_table(&self, table: Table, rows: Vec<RawRecord>) {
        self.tables.lock().unwrap().insert(table, rows);
    }

    pub fn fail_table(&self, table: Table) {
        self.failing_tables.lock().unwrap().insert(table);
    }

    pub fn pulls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn last_pull(&self) -> Option<PullRequest> {
        self.pull_requests.lock().unwrap().last().cloned()
    }

    pub fn last_push(&self) -> Option<PushRequest> {
        self.push_requests.lock().unwrap().last().cloned()
    }

    /// A small but complete account: profile, one book, the achievement catalog
    pub fn seed_account(&self) {
        self.set_table(
            Table::Profiles,
            vec![record(serde_json::json!({
                "id": USER_ID,
                "username": "reader",
                "created_at": "2024-01-01T00:00:00Z"
            }))],
        );
        self.set_table(
            Table::Books,
            vec![record(serde_json::json!({
                "id": "book-1",
                "title": "Dune",
                "api_metadata": {"pages": 412},
                "created_at": "2024-01-02T00:00:00Z"
            }))],
        );
        self.set_table(
            Table::Achievements,
            vec![record(serde_json::json!({"id": "ach-1", "name": "First book"}))],
        );
    }
}

#[async_trait]
impl RemoteBackend for FakeBackend {
    async fn pull_changes(
        &self,
        _session: &Session,
        request: PullRequest,
    ) -> Result<PullResponse, RemoteError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.pull_requests.lock().unwrap().push(request);
        if self.block_pull.load(Ordering::SeqCst) {
            self.pull_entered.notify_one();
            self.release_pull.notified().await;
        }
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RemoteError::Other("pull unavailable".to_string()));
        }
        Ok(self.pull_response.lock().unwrap().clone())
    }

    async fn push_changes(
        &self,
        _session: &Session,
        request: PushRequest,
    ) -> Result<PushResponse, RemoteError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.push_requests.lock().unwrap().push(request);
        if self.conflict_push.load(Ordering::SeqCst) {
            return Err(RemoteError::Conflict("stale checkpoint".to_string()));
        }
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(RemoteError::Other("push unavailable".to_string()));
        }
        Ok(PushResponse {
            ok: true,
            conflict: false,
            message: None,
        })
    }

    async fn fetch_table(
        &self,
        _session: &Session,
        table: Table,
        _user_id: Option<&str>,
    ) -> Result<Vec<RawRecord>, RemoteError> {
        self.fetched_tables.lock().unwrap().push(table);
        if self.failing_tables.lock().unwrap().contains(&table) {
            return Err(RemoteError::Http {
                status: 500,
                body: format!("{} unavailable", table),
            });
        }
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(&table)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct StaticConnectivity(pub ConnectivityState);

#[async_trait]
impl ConnectivitySource for StaticConnectivity {
    async fn fetch(&self) -> anyhow::Result<ConnectivityState> {
        Ok(self.0.clone())
    }
}

pub fn online() -> ConnectivityState {
    ConnectivityState {
        is_connected: true,
        is_internet_reachable: Some(true),
        connection_type: "wifi".to_string(),
    }
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub backend: Arc<FakeBackend>,
    pub clock: Arc<FakeClock>,
    pub status: Arc<SyncStatusStore>,
    pub coordinator: SyncCoordinator,
}

pub fn harness() -> Harness {
    harness_with(&SyncSettings::default())
}

pub fn harness_with(settings: &SyncSettings) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backend = FakeBackend::new();
    let clock = Arc::new(FakeClock::default());
    let coordinator = SyncCoordinator::new(
        store.clone(),
        Arc::new(MemoryKvStore::new()),
        backend.clone(),
        Arc::new(StaticConnectivity(online())),
        clock.clone() as Arc<dyn Clock>,
        settings,
    );
    let status = Arc::clone(coordinator.status_store());
    Harness {
        store,
        backend,
        clock,
        status,
        coordinator,
    }
}

pub async fn pending_count(store: &SqliteStore) -> usize {
    store.pending_changes().await.unwrap().record_count()
}
