//! Serializable views of the warden's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::ArchiveRecord;
use crate::dispatcher::{Owner, WatchedSource};
use crate::locator::Plugin;
use crate::quota::StorageSnapshot;
use crate::recorder::CaptureJob;

/// One watched source as observers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceView {
    pub url: String,
    /// Plugin currently polling the URL; `None` while parked or recording.
    pub owner: Option<String>,
    pub plugins: Vec<String>,
    pub active_plugin: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_known_bitrate: Option<u64>,
    pub last_known_validity: Option<bool>,
    pub recording: bool,
}

impl SourceView {
    pub(crate) fn new(source: &WatchedSource, owner: Option<Owner>, recording: bool) -> Self {
        Self {
            url: source.url.clone(),
            owner: match owner {
                Some(Owner::Plugin(name)) => Some(name),
                _ => None,
            },
            plugins: source.plugin_names(),
            active_plugin: source.active_plugin().map(|p| p.name().to_string()),
            last_seen_at: source.last_seen_at,
            last_known_bitrate: source.last_known_bitrate,
            last_known_validity: source.last_known_validity,
            recording,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginView {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Number of URLs the plugin's locator polls.
    pub urls: usize,
}

impl From<&Plugin> for PluginView {
    fn from(plugin: &Plugin) -> Self {
        Self {
            id: plugin.id(),
            name: plugin.name().to_string(),
            enabled: plugin.is_enabled(),
            urls: plugin.locator().urls().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaView {
    pub name: String,
    pub usage: u64,
    pub quota: u64,
    pub decision: bool,
}

/// Full state, for observers that connect late.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenSnapshot {
    pub sources: Vec<SourceView>,
    pub plugins: Vec<PluginView>,
    pub jobs: Vec<CaptureJob>,
    pub archives: Vec<ArchiveRecord>,
    pub paused: bool,
    pub quotas: Vec<QuotaView>,
    pub storage: StorageSnapshot,
}

/// What [`Warden::restore`](super::Warden::restore) loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub plugins: usize,
    pub sources: usize,
    pub archives: usize,
}
