//! Runtime configuration.
//!
//! Values come from defaults overridden by `WARDEN_*` environment variables
//! (a `.env` file is honoured).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::notification::WebhookConfig;
use crate::recorder::RecorderConfig;
use crate::{Error, Result};

/// One configured plugin: a name and the URL pattern its extractor accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub name: String,
    pub pattern: String,
}

/// Parse `name=regex;name=regex`. Empty entries are skipped.
pub fn parse_plugin_definitions(raw: &str) -> Result<Vec<PluginDefinition>> {
    let mut definitions: Vec<PluginDefinition> = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, pattern) = entry
            .split_once('=')
            .ok_or_else(|| Error::config(format!("Plugin definition '{}' is missing '='", entry)))?;
        let name = name.trim();
        let pattern = pattern.trim();
        if name.is_empty() || pattern.is_empty() {
            return Err(Error::config(format!(
                "Plugin definition '{}' needs a name and a pattern",
                entry
            )));
        }
        if definitions.iter().any(|d| d.name == name) {
            return Err(Error::config(format!("Plugin '{}' is defined twice", name)));
        }
        definitions.push(PluginDefinition {
            name: name.to_string(),
            pattern: pattern.to_string(),
        });
    }
    Ok(definitions)
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub database_url: String,
    /// Where captures are written while in progress.
    pub recording_dir: PathBuf,
    /// Where finished captures are moved.
    pub archive_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffmpeg_input_args: Vec<String>,
    pub ffmpeg_output_args: Vec<String>,
    pub poll_interval_ms: u64,
    pub disk_check_interval_ms: u64,
    pub quit_timeout_ms: u64,
    pub progress_window_ms: u64,
    /// Maximum simultaneous captures. 0 disables the quota.
    pub instance_quota: u64,
    /// Maximum bytes in the archive directory. 0 disables the quota.
    pub storage_quota_bytes: u64,
    /// Maximum summed capture bitrate in bytes per second. 0 disables the quota.
    pub download_speed_quota: u64,
    pub webhook_url: Option<String>,
    pub log_dir: PathBuf,
    pub log_filter: Option<String>,
    pub plugins: Vec<PluginDefinition>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:warden.db".to_string(),
            recording_dir: PathBuf::from("./recordings"),
            archive_dir: PathBuf::from("./archive"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_input_args: Vec::new(),
            ffmpeg_output_args: Vec::new(),
            poll_interval_ms: 30_000,
            disk_check_interval_ms: 60_000,
            quit_timeout_ms: 10_000,
            progress_window_ms: 1_000,
            instance_quota: 0,
            storage_quota_bytes: 0,
            download_speed_quota: 0,
            webhook_url: None,
            log_dir: PathBuf::from("./logs"),
            log_filter: None,
            plugins: vec![PluginDefinition {
                name: "hls".to_string(),
                pattern: r"(?i)^https?://.+\.m3u8(\?.*)?$".to_string(),
            }],
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

impl WardenConfig {
    /// Load `.env` (if any) and apply `WARDEN_*` overrides to the defaults.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WARDEN_DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = get("WARDEN_RECORDING_DIR") {
            config.recording_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WARDEN_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WARDEN_FFMPEG_PATH").or_else(|| get("FFMPEG_PATH")) {
            config.ffmpeg_path = v;
        }
        if let Some(v) = get("WARDEN_FFMPEG_INPUT_ARGS") {
            config.ffmpeg_input_args = split_args(&v);
        }
        if let Some(v) = get("WARDEN_FFMPEG_OUTPUT_ARGS") {
            config.ffmpeg_output_args = split_args(&v);
        }

        let numbers: [(&str, &mut u64); 7] = [
            ("WARDEN_POLL_INTERVAL_MS", &mut config.poll_interval_ms),
            ("WARDEN_DISK_CHECK_INTERVAL_MS", &mut config.disk_check_interval_ms),
            ("WARDEN_QUIT_TIMEOUT_MS", &mut config.quit_timeout_ms),
            ("WARDEN_PROGRESS_WINDOW_MS", &mut config.progress_window_ms),
            ("WARDEN_INSTANCE_QUOTA", &mut config.instance_quota),
            ("WARDEN_STORAGE_QUOTA_BYTES", &mut config.storage_quota_bytes),
            ("WARDEN_DOWNLOAD_SPEED_QUOTA", &mut config.download_speed_quota),
        ];
        for (key, field) in numbers {
            if let Some(v) = get(key) {
                *field = parse_number(key, &v)?;
            }
        }

        if let Some(v) = get("WARDEN_WEBHOOK_URL") {
            config.webhook_url = Some(v);
        }
        if let Some(v) = get("WARDEN_LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WARDEN_LOG_FILTER") {
            config.log_filter = Some(v);
        }
        if let Some(v) = get("WARDEN_PLUGINS") {
            config.plugins = parse_plugin_definitions(&v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be positive"));
        }
        if self.disk_check_interval_ms == 0 {
            return Err(Error::config("disk_check_interval_ms must be positive"));
        }
        if self.plugins.is_empty() {
            return Err(Error::config("at least one plugin must be defined"));
        }
        for plugin in &self.plugins {
            regex::Regex::new(&plugin.pattern).map_err(|e| {
                Error::config(format!("Plugin '{}' has an invalid pattern: {}", plugin.name, e))
            })?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn disk_check_interval(&self) -> Duration {
        Duration::from_millis(self.disk_check_interval_ms)
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            archive_dir: self.archive_dir.clone(),
            quit_timeout: Duration::from_millis(self.quit_timeout_ms),
            progress_window: Duration::from_millis(self.progress_window_ms),
        }
    }

    pub fn webhook_config(&self) -> Option<WebhookConfig> {
        self.webhook_url.as_ref().map(|url| WebhookConfig::new(url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = WardenConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.instance_quota, 0);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_apply() {
        let config = WardenConfig::from_lookup(lookup(&[
            ("WARDEN_ARCHIVE_DIR", "/data/archive"),
            ("WARDEN_INSTANCE_QUOTA", "3"),
            ("WARDEN_DOWNLOAD_SPEED_QUOTA", "1000000"),
            ("WARDEN_FFMPEG_OUTPUT_ARGS", "-f mpegts"),
            ("WARDEN_WEBHOOK_URL", "https://hooks.example/x"),
            ("WARDEN_PLUGINS", "a=^https://a\\.tv/; b=^https://b\\.tv/"),
            ("WARDEN_LOG_FILTER", "  "),
        ]))
        .unwrap();

        assert_eq!(config.archive_dir, PathBuf::from("/data/archive"));
        assert_eq!(config.instance_quota, 3);
        assert_eq!(config.download_speed_quota, 1_000_000);
        assert_eq!(config.ffmpeg_output_args, vec!["-f", "mpegts"]);
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[1].name, "b");
        assert!(config.log_filter.is_none());
        assert_eq!(config.webhook_config().unwrap().url, "https://hooks.example/x");
        assert_eq!(config.recorder_config().archive_dir, PathBuf::from("/data/archive"));
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        for vars in [
            [("WARDEN_INSTANCE_QUOTA", "-1")],
            [("WARDEN_POLL_INTERVAL_MS", "0")],
            [("WARDEN_PLUGINS", "a=(")],
            [("WARDEN_PLUGINS", "nopattern")],
        ] {
            let result = WardenConfig::from_lookup(lookup(&vars));
            assert!(matches!(result, Err(Error::Configuration(_))), "{:?}", vars);
        }
    }

    #[test]
    fn test_plugin_definitions() {
        let defs = parse_plugin_definitions("a=x; ;b = y=z").unwrap();
        assert_eq!(defs[0], PluginDefinition { name: "a".into(), pattern: "x".into() });
        assert_eq!(defs[1].pattern, "y=z");
        assert!(parse_plugin_definitions("a=x;a=y").is_err());
        assert!(parse_plugin_definitions("=x").is_err());
    }
}
