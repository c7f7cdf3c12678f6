//! The contract the sync layer needs from the on-device relational store.

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use shelf_proto::{Changeset, RawRecord};

use crate::tables::Table;

/// Typed collections of records keyed by a backend-assigned `id`, plus the
/// sync bookkeeping (pending-change ledger and pull checkpoint).
///
/// Only the sync engine and the migration importer write through this trait;
/// `create`/`update`/`delete` are the application's local edits and are the
/// source of the pending-change ledger.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn fetch_all(&self, table: Table) -> Result<Vec<RawRecord>>;
    async fn count(&self, table: Table) -> Result<usize>;
    async fn find(&self, table: Table, id: &str) -> Result<Option<RawRecord>>;

    /// Insert already-synced records in a single transaction. Returns the number inserted.
    async fn bulk_create(&self, table: Table, records: Vec<RawRecord>) -> Result<usize>;

    /// Create a record locally, assigning an id if it has none. Returns the id.
    async fn create(&self, table: Table, record: RawRecord) -> Result<String>;
    /// Merge `fields` into an existing record.
    async fn update(&self, table: Table, id: &str, fields: RawRecord) -> Result<()>;
    async fn delete(&self, table: Table, id: &str) -> Result<()>;

    /// Apply a pulled changeset in one transaction. Returns the number of records touched.
    async fn apply_remote_changes(&self, changes: &Changeset) -> Result<usize>;
    /// Local edits not yet acknowledged by the backend
    async fn pending_changes(&self) -> Result<Changeset>;
    /// Clear the ledger entries for a pushed changeset
    async fn mark_synced(&self, changes: &Changeset) -> Result<()>;

    async fn last_pulled_at(&self) -> Result<Option<i64>>;
    async fn set_last_pulled_at(&self, timestamp: i64) -> Result<()>;
    async fn clear_last_pulled_at(&self) -> Result<()>;

    /// Drop every record and all sync metadata
    async fn reset(&self) -> Result<()>;
}
