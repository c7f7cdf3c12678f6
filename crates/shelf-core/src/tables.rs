//! Static registry of the synced tables and their wire-to-local record transforms.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use shelf_proto::RawRecord;
use std::fmt;
use std::str::FromStr;

/// Every table the sync layer knows about, in migration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Profiles,
    Books,
    Deadlines,
    DeadlineProgress,
    DeadlineStatus,
    ReadingSessions,
    UserActivities,
    Achievements,
    UserAchievements,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Profiles,
        Table::Books,
        Table::Deadlines,
        Table::DeadlineProgress,
        Table::DeadlineStatus,
        Table::ReadingSessions,
        Table::UserActivities,
        Table::Achievements,
        Table::UserAchievements,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Books => "books",
            Table::Deadlines => "deadlines",
            Table::DeadlineProgress => "deadline_progress",
            Table::DeadlineStatus => "deadline_status",
            Table::ReadingSessions => "reading_sessions",
            Table::UserActivities => "user_activities",
            Table::Achievements => "achievements",
            Table::UserAchievements => "user_achievements",
        }
    }

    /// Column holding the owning user's id; `None` for shared catalogs
    pub fn user_column(self) -> Option<&'static str> {
        match self {
            Table::Profiles => Some("id"),
            Table::Achievements => None,
            _ => Some("user_id"),
        }
    }

    /// Fields sent as date/time strings and stored as epoch milliseconds
    pub fn timestamp_fields(self) -> &'static [&'static str] {
        match self {
            Table::Profiles => &["created_at", "updated_at"],
            Table::Books => &["created_at", "updated_at", "publication_date"],
            Table::Deadlines => &["created_at", "updated_at", "deadline_date"],
            Table::DeadlineProgress => &["created_at", "updated_at"],
            Table::DeadlineStatus => &["created_at", "updated_at"],
            Table::ReadingSessions => &["created_at", "updated_at", "started_at", "ended_at"],
            Table::UserActivities => &["created_at"],
            Table::Achievements => &["created_at", "updated_at"],
            Table::UserAchievements => &["created_at", "unlocked_at"],
        }
    }

    /// Fields sent as JSON objects and stored as serialized strings
    pub fn json_fields(self) -> &'static [&'static str] {
        match self {
            Table::Books => &["api_metadata"],
            Table::UserActivities => &["activity_data"],
            Table::Achievements => &["criteria"],
            Table::UserAchievements => &["progress_data"],
            _ => &[],
        }
    }

    /// Convert a backend row into the local representation. Fields not listed
    /// in the registry pass through unchanged.
    pub fn map_record(self, mut record: RawRecord) -> RawRecord {
        for field in self.timestamp_fields() {
            if let Some(value) = record.get_mut(*field) {
                if let Some(ms) = value.as_str().and_then(parse_timestamp) {
                    *value = Value::from(ms);
                }
            }
        }
        for field in self.json_fields() {
            if let Some(value) = record.get_mut(*field) {
                if value.is_object() || value.is_array() {
                    *value = Value::String(value.to_string());
                }
            }
        }
        record
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.name() == name)
            .ok_or_else(|| format!("unknown table '{}'", name))
    }
}

/// Parse an RFC 3339 date-time or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    // Postgres renders timestamptz with a space separator
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}
