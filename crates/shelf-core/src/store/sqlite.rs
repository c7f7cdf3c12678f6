use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use shelf_proto::{Changeset, RawRecord};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::LocalStore;
use crate::tables::Table;

const LAST_PULLED_AT_KEY: &str = "last_pulled_at";

/// Position of a row in the pending-change ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Synced,
    Created,
    Updated,
    Deleted,
}

impl RecordState {
    fn as_str(self) -> &'static str {
        match self {
            RecordState::Synced => "synced",
            RecordState::Created => "created",
            RecordState::Updated => "updated",
            RecordState::Deleted => "deleted",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "synced" => Ok(RecordState::Synced),
            "created" => Ok(RecordState::Created),
            "updated" => Ok(RecordState::Updated),
            "deleted" => Ok(RecordState::Deleted),
            other => Err(anyhow!("corrupt sync_status '{}'", other)),
        }
    }
}

/// Local store backed by a single SQLite file. Records of every collection
/// share one table and are stored as JSON documents.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn record_id(record: &RawRecord) -> Result<String> {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(anyhow!("record has no usable id")),
    }
}

fn encode(record: &RawRecord) -> Result<String> {
    serde_json::to_string(record).context("Failed to serialize record")
}

fn decode(data: &str) -> Result<RawRecord> {
    serde_json::from_str(data).context("Failed to deserialize stored record")
}

fn row_state(tx: &Transaction<'_>, table: Table, id: &str) -> Result<Option<RecordState>> {
    let state: Option<String> = tx
        .query_row(
            "SELECT sync_status FROM records WHERE collection = ?1 AND id = ?2",
            params![table.name(), id],
            |row| row.get(0),
        )
        .optional()?;
    state.as_deref().map(RecordState::parse).transpose()
}

fn upsert(
    tx: &Transaction<'_>,
    table: Table,
    id: &str,
    record: &RawRecord,
    state: RecordState,
) -> Result<()> {
    tx.execute(
        "INSERT INTO records (collection, id, data, sync_status)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, id) DO UPDATE SET
            data = excluded.data,
            sync_status = excluded.sync_status",
        params![table.name(), id, encode(record)?, state.as_str()],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Open the database at the given path and initialize tables if needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create db directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        // The daemon opens this file once per store
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'synced',
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS records_pending
                ON records (sync_status) WHERE sync_status != 'synced';
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("local store lock poisoned"))
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn fetch_all(&self, table: Table) -> Result<Vec<RawRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM records
             WHERE collection = ?1 AND sync_status != 'deleted'
             ORDER BY id",
        )?;
        let mut rows = stmt.query(params![table.name()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            records.push(decode(&data)?);
        }
        Ok(records)
    }

    async fn count(&self, table: Table) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1 AND sync_status != 'deleted'",
            params![table.name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn find(&self, table: Table, id: &str) -> Result<Option<RawRecord>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records
                 WHERE collection = ?1 AND id = ?2 AND sync_status != 'deleted'",
                params![table.name(), id],
                |row| row.get(0),
            )
            .optional()?;
        data.as_deref().map(decode).transpose()
    }

    async fn bulk_create(&self, table: Table, records: Vec<RawRecord>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in &records {
            let id = record_id(record).with_context(|| format!("Invalid {} record", table))?;
            upsert(&tx, table, &id, record, RecordState::Synced)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    async fn create(&self, table: Table, mut record: RawRecord) -> Result<String> {
        let id = match record.get("id") {
            Some(_) => record_id(&record)?,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                record.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (collection, id, data, sync_status) VALUES (?1, ?2, ?3, ?4)",
            params![table.name(), id, encode(&record)?, RecordState::Created.as_str()],
        )
        .with_context(|| format!("Failed to create {} record {}", table, id))?;
        Ok(id)
    }

    async fn update(&self, table: Table, id: &str, fields: RawRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT data, sync_status FROM records WHERE collection = ?1 AND id = ?2",
                params![table.name(), id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((data, state)) = existing else {
            bail!("{} record {} not found", table, id);
        };
        let state = RecordState::parse(&state)?;
        if state == RecordState::Deleted {
            bail!("{} record {} has been deleted", table, id);
        }

        let mut record = decode(&data)?;
        for (key, value) in fields {
            if key != "id" {
                record.insert(key, value);
            }
        }
        let next = if state == RecordState::Created {
            RecordState::Created
        } else {
            RecordState::Updated
        };
        upsert(&tx, table, id, &record, next)?;
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match row_state(&tx, table, id)? {
            None => debug!(%table, id, "delete of unknown record ignored"),
            // Never seen by the backend, nothing to push
            Some(RecordState::Created) => {
                tx.execute(
                    "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                    params![table.name(), id],
                )?;
            }
            Some(_) => {
                tx.execute(
                    "UPDATE records SET sync_status = ?3 WHERE collection = ?1 AND id = ?2",
                    params![table.name(), id, RecordState::Deleted.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn apply_remote_changes(&self, changes: &Changeset) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut applied = 0;
        for (name, table_changes) in changes.iter() {
            let table: Table = match name.parse() {
                Ok(table) => table,
                Err(_) => {
                    warn!(table = %name, "skipping pulled changes for unknown table");
                    continue;
                }
            };
            for record in table_changes.created.iter().chain(&table_changes.updated) {
                let id = record_id(record)
                    .with_context(|| format!("Invalid pulled {} record", table))?;
                if let Some(state) = row_state(&tx, table, &id)? {
                    if state != RecordState::Synced {
                        debug!(%table, id, "keeping pending local edit over pulled change");
                        continue;
                    }
                }
                upsert(&tx, table, &id, record, RecordState::Synced)?;
                applied += 1;
            }
            for id in &table_changes.deleted {
                applied += tx.execute(
                    "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                    params![table.name(), id],
                )?;
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    async fn pending_changes(&self) -> Result<Changeset> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT collection, id, data, sync_status FROM records
             WHERE sync_status != 'synced'
             ORDER BY collection, id",
        )?;
        let mut rows = stmt.query([])?;
        let mut changes = Changeset::new();
        while let Some(row) = rows.next()? {
            let collection: String = row.get(0)?;
            let id: String = row.get(1)?;
            let data: String = row.get(2)?;
            let state: String = row.get(3)?;
            let entry = changes.table_mut(&collection);
            match RecordState::parse(&state)? {
                RecordState::Created => entry.created.push(decode(&data)?),
                RecordState::Updated => entry.updated.push(decode(&data)?),
                RecordState::Deleted => entry.deleted.push(id),
                RecordState::Synced => {}
            }
        }
        Ok(changes)
    }

    async fn mark_synced(&self, changes: &Changeset) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (collection, table_changes) in changes.iter() {
            // Rows edited again after the push was built keep their pending state.
            // Compared as parsed JSON: floats need not survive a text round trip.
            for record in table_changes.created.iter().chain(&table_changes.updated) {
                let id = record_id(record)?;
                let stored: Option<String> = tx
                    .query_row(
                        "SELECT data FROM records
                         WHERE collection = ?1 AND id = ?2
                           AND sync_status IN ('created', 'updated')",
                        params![collection, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(stored) = stored else { continue };
                if decode(&stored)? == *record {
                    tx.execute(
                        "UPDATE records SET sync_status = 'synced' WHERE collection = ?1 AND id = ?2",
                        params![collection, id],
                    )?;
                }
            }
            for id in &table_changes.deleted {
                tx.execute(
                    "DELETE FROM records
                     WHERE collection = ?1 AND id = ?2 AND sync_status = 'deleted'",
                    params![collection, id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn last_pulled_at(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![LAST_PULLED_AT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|raw| {
                raw.parse::<i64>()
                    .with_context(|| format!("Corrupt checkpoint value '{}'", raw))
            })
            .transpose()
    }

    async fn set_last_pulled_at(&self, timestamp: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_PULLED_AT_KEY, timestamp.to_string()],
        )?;
        Ok(())
    }

    async fn clear_last_pulled_at(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM sync_meta WHERE key = ?1",
            params![LAST_PULLED_AT_KEY],
        )?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM sync_meta", [])?;
        tx.commit()?;
        Ok(())
    }
}
