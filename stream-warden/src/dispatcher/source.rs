//! Watched source entity.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::locator::Plugin;
use crate::{Error, Result};

/// Case-insensitive registry key for a source URL.
pub fn source_key(url: &str) -> String {
    url.trim().to_lowercase()
}

/// A registered URL under continuous observation.
#[derive(Debug, Clone)]
pub struct WatchedSource {
    /// URL as registered.
    pub url: String,
    /// Last time the source was detected live.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last observed capture bitrate in bytes per second.
    pub last_known_bitrate: Option<u64>,
    /// Result of the last compatibility/validity check.
    pub last_known_validity: Option<bool>,
    /// Compatible plugins, highest priority first.
    pub plugins: Vec<Arc<Plugin>>,
}

impl WatchedSource {
    pub fn new(url: impl Into<String>, plugins: Vec<Arc<Plugin>>) -> Self {
        let url = url.into().trim().to_string();
        Self {
            last_known_validity: Some(!plugins.is_empty()),
            url,
            last_seen_at: None,
            last_known_bitrate: None,
            plugins,
        }
    }

    pub fn key(&self) -> String {
        source_key(&self.url)
    }

    /// Highest-priority enabled plugin.
    pub fn active_plugin(&self) -> Option<&Arc<Plugin>> {
        self.plugins.iter().find(|p| p.is_enabled())
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Move the plugin at `from` to `to` in this source's priority list.
    pub fn reorder_plugin(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.plugins.len();
        if from >= len || to >= len {
            return Err(Error::validation(format!(
                "Source plugin index out of range: {} -> {} (len {})",
                from, to, len
            )));
        }
        let plugin = self.plugins.remove(from);
        self.plugins.insert(to, plugin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_is_case_insensitive() {
        assert_eq!(
            source_key("  https://Example.TV/Room "),
            source_key("https://example.tv/room")
        );
    }

    #[test]
    fn test_new_source_without_plugins_is_invalid() {
        let source = WatchedSource::new(" https://example.tv/a ", Vec::new());
        assert_eq!(source.url, "https://example.tv/a");
        assert_eq!(source.last_known_validity, Some(false));
        assert!(source.active_plugin().is_none());
        assert!(source.last_seen_at.is_none());
    }
}
