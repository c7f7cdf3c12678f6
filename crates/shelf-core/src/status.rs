//! Persisted outcome of the most recent sync round.
//!
//! Each field of [`SyncStatusRecord`] lives under its own key in a
//! [`KeyValueStore`]. Tracking is best-effort: read failures fall back to
//! defaults and write failures are logged, never propagated, so a broken
//! status store can not block sync itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::clock::Clock;
use crate::kv::KeyValueStore;

pub const STATUS_KEY: &str = "shelf.sync.status";
pub const LAST_SYNC_TIME_KEY: &str = "shelf.sync.last_sync_time";
pub const LAST_ERROR_KEY: &str = "shelf.sync.last_error";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Never,
    Syncing,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Never => "never",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "never" => Ok(SyncStatus::Never),
            "syncing" => Ok(SyncStatus::Syncing),
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusRecord {
    pub status: SyncStatus,
    /// Epoch milliseconds of the last successful round
    pub last_sync_time: Option<i64>,
    pub last_error: Option<String>,
}

pub struct SyncStatusStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl SyncStatusStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.kv.get_item(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "failed to read sync status key");
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.kv.set_item(key, value).await {
            warn!(key, error = %e, "failed to persist sync status key");
        }
    }

    pub async fn get_status(&self) -> SyncStatus {
        match self.read(STATUS_KEY).await {
            Some(raw) => raw.parse().unwrap_or_else(|e: String| {
                warn!(error = %e, "invalid persisted sync status, treating as never");
                SyncStatus::Never
            }),
            None => SyncStatus::Never,
        }
    }

    /// Record a status. `Success` also stamps the sync time and clears the last error.
    pub async fn set_status(&self, status: SyncStatus) {
        self.write(STATUS_KEY, status.as_str()).await;
        if status == SyncStatus::Success {
            let now = self.clock.now_ms().to_string();
            self.write(LAST_SYNC_TIME_KEY, &now).await;
            if let Err(e) = self.kv.remove_item(LAST_ERROR_KEY).await {
                warn!(error = %e, "failed to clear last sync error");
            }
        }
    }

    /// Record a failed round.
    pub async fn set_error(&self, message: &str) {
        self.write(STATUS_KEY, SyncStatus::Error.as_str()).await;
        self.write(LAST_ERROR_KEY, message).await;
    }

    pub async fn get_last_sync_time(&self) -> Option<i64> {
        let raw = self.read(LAST_SYNC_TIME_KEY).await?;
        match raw.parse() {
            Ok(ms) => Some(ms),
            Err(_) => {
                warn!(value = %raw, "invalid persisted last sync time");
                None
            }
        }
    }

    pub async fn get_last_error(&self) -> Option<String> {
        self.read(LAST_ERROR_KEY).await
    }

    /// Best-effort snapshot of all three fields; the reads are independent.
    pub async fn get_sync_status_info(&self) -> SyncStatusRecord {
        let (status, last_sync_time, last_error) = tokio::join!(
            self.get_status(),
            self.get_last_sync_time(),
            self.get_last_error()
        );
        SyncStatusRecord {
            status,
            last_sync_time,
            last_error,
        }
    }

    pub async fn clear_sync_data(&self) {
        if let Err(e) = self
            .kv
            .multi_remove(&[STATUS_KEY, LAST_SYNC_TIME_KEY, LAST_ERROR_KEY])
            .await
        {
            warn!(error = %e, "failed to clear sync status");
        }
    }

    /// True if never synced, or if strictly more than `interval` has passed since
    /// the last successful round. The last error is deliberately ignored.
    pub async fn should_auto_sync(&self, interval: Duration) -> bool {
        match self.get_last_sync_time().await {
            None => true,
            Some(last) => {
                let elapsed = self.clock.now_ms() - last;
                elapsed > interval.as_millis() as i64
            }
        }
    }
}
