use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single row as exchanged with the backend: column name to JSON value.
/// Every record carries its backend-assigned primary key under `id`.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Created/updated/deleted records for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    #[serde(default)]
    pub created: Vec<RawRecord>,
    #[serde(default)]
    pub updated: Vec<RawRecord>,
    /// Primary keys of deleted records
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Table-keyed collection of changes, used in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Changeset(pub BTreeMap<String, TableChanges>);

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes for `table`, inserting an empty entry if needed
    pub fn table_mut(&mut self, table: &str) -> &mut TableChanges {
        self.0.entry(table.to_string()).or_default()
    }

    pub fn get(&self, table: &str) -> Option<&TableChanges> {
        self.0.get(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TableChanges)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(TableChanges::is_empty)
    }

    /// Total number of records touched across all tables
    pub fn record_count(&self) -> usize {
        self.0.values().map(TableChanges::len).sum()
    }
}

/// Body of the pull RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Checkpoint in epoch milliseconds, 0 meaning "from the beginning"
    pub last_pulled_at: i64,
    pub schema_version: u32,
    pub migration: Option<serde_json::Value>,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub changes: Changeset,
    /// New checkpoint in epoch milliseconds
    pub timestamp: i64,
}

/// Body of the push RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Changeset,
    pub last_pulled_at: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    #[serde(default = "default_ok")]
    pub ok: bool,
    /// Set by the backend when the push was rejected as stale
    #[serde(default)]
    pub conflict: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_ok() -> bool {
    true
}
