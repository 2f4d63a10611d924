//! Database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::ms_to_datetime;
use crate::Result;

/// Persisted plugin state.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PluginDbModel {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Position in the global priority list, 0 first.
    pub priority: i64,
}

/// Persisted watched source.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SourceDbModel {
    pub id: i64,
    pub url: String,
    /// Epoch milliseconds.
    pub last_seen_at: Option<i64>,
    pub last_known_bitrate: Option<i64>,
    pub last_known_validity: Option<bool>,
    /// JSON array of plugin names, highest priority first.
    pub plugin_order: String,
    pub created_at: i64,
}

impl SourceDbModel {
    pub fn plugin_names(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.plugin_order)?)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen_at.map(ms_to_datetime)
    }
}

/// A finished capture kept in the archive directory.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: i64,
    /// Label (watched URL) the capture was taken for.
    pub label: String,
    pub path: String,
    pub size_bytes: i64,
    pub duration_secs: f64,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl ArchiveRecord {
    pub fn created(&self) -> DateTime<Utc> {
        ms_to_datetime(self.created_at)
    }
}

/// Fields for a new archive record; id and timestamp are assigned on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArchiveRecord {
    pub label: String,
    pub path: String,
    pub size_bytes: i64,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_names_from_json() {
        let source = SourceDbModel {
            id: 1,
            url: "https://a.tv/x".into(),
            last_seen_at: None,
            last_known_bitrate: None,
            last_known_validity: None,
            plugin_order: r#"["site","generic"]"#.into(),
            created_at: 0,
        };
        assert_eq!(source.plugin_names().unwrap(), vec!["site", "generic"]);
        assert!(source.last_seen().is_none());

        let broken = SourceDbModel {
            plugin_order: "not json".into(),
            ..source
        };
        assert!(broken.plugin_names().is_err());
    }
}
