//! Plugin registry.
//!
//! The [`PluginManager`] owns the priority-ordered list of plugins, each
//! wrapping one [`LocatorService`]. It fans lifecycle calls out to the
//! locators and merges their live events into one channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::service::{LiveEvent, LocatorService};
use crate::{Error, Result};

/// Capacity of the manager-wide live event channel.
const MANAGER_CHANNEL_CAPACITY: usize = 256;

/// A named, enable/disable-able adapter around one locator.
///
/// Identity is the name. The id is a storage handle: negative placeholders are
/// handed out at registration until persistence assigns a real one.
#[derive(Debug)]
pub struct Plugin {
    id: AtomicI64,
    name: String,
    enabled: AtomicBool,
    locator: Arc<LocatorService>,
}

impl Plugin {
    pub fn id(&self) -> i64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn locator(&self) -> &Arc<LocatorService> {
        &self.locator
    }
}

/// Registry of plugins in priority order (index 0 first).
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<Plugin>>>,
    running: AtomicBool,
    paused: AtomicBool,
    next_placeholder_id: AtomicI64,
    live_tx: broadcast::Sender<LiveEvent>,
}

impl PluginManager {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(MANAGER_CHANNEL_CAPACITY);
        Self {
            plugins: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            next_placeholder_id: AtomicI64::new(-1),
            live_tx,
        }
    }

    /// Register a plugin. It starts enabled, at the lowest priority.
    pub fn register(
        &self,
        name: impl Into<String>,
        locator: Arc<LocatorService>,
    ) -> Result<Arc<Plugin>> {
        let name = name.into();
        let mut plugins = self.plugins.write();
        if plugins.iter().any(|p| p.name == name) {
            return Err(Error::validation(format!(
                "Plugin '{}' is already registered",
                name
            )));
        }

        locator.connect(self.live_tx.clone());
        if self.is_paused() {
            locator.pause();
        }
        if self.is_running() {
            locator.start();
        }

        let plugin = Arc::new(Plugin {
            id: AtomicI64::new(self.next_placeholder_id.fetch_sub(1, Ordering::SeqCst)),
            name,
            enabled: AtomicBool::new(true),
            locator,
        });
        plugins.push(plugin.clone());
        info!(plugin = %plugin.name, id = plugin.id(), "Plugin registered");

        Ok(plugin)
    }

    /// Subscribe to live events from every plugin.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.live_tx.subscribe()
    }

    /// Snapshot of the plugins in priority order.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.plugins.read().clone()
    }

    pub fn plugin_by_id(&self, id: i64) -> Option<Arc<Plugin>> {
        self.plugins.read().iter().find(|p| p.id() == id).cloned()
    }

    pub fn plugin_by_name(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().iter().find(|p| p.name == name).cloned()
    }

    /// Every plugin whose locator understands `url`, in priority order.
    pub fn find_compatible_plugins(&self, url: &str) -> Vec<Arc<Plugin>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.locator.can_parse(url))
            .cloned()
            .collect()
    }

    /// Record the persisted id of a plugin.
    pub fn assign_id(&self, name: &str, id: i64) -> Result<()> {
        let plugin = self
            .plugin_by_name(name)
            .ok_or_else(|| Error::not_found("Plugin", name))?;
        plugin.id.store(id, Ordering::SeqCst);
        Ok(())
    }

    /// Enable or disable a plugin, starting or stopping its locator.
    ///
    /// Returns `Ok(false)` when the plugin was already in the requested state.
    pub async fn enable_plugin(&self, id: i64, enabled: bool) -> Result<bool> {
        let plugin = self
            .plugin_by_id(id)
            .ok_or_else(|| Error::not_found("Plugin", id.to_string()))?;

        if plugin.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return Ok(false);
        }

        if enabled {
            if self.is_running() {
                plugin.locator.start();
            }
        } else {
            plugin.locator.stop().await;
        }

        info!(plugin = %plugin.name, enabled, "Plugin enablement changed");
        Ok(true)
    }

    /// Move the plugin at `from` to `to`, shifting the others.
    pub fn reorder_plugin(&self, from: usize, to: usize) -> Result<()> {
        let mut plugins = self.plugins.write();
        let len = plugins.len();
        if from >= len || to >= len {
            return Err(Error::validation(format!(
                "Plugin index out of range: {} -> {} (len {})",
                from, to, len
            )));
        }
        let plugin = plugins.remove(from);
        plugins.insert(to, plugin);
        Ok(())
    }

    /// Re-sort the plugins by an explicit id list.
    ///
    /// The list must name every registered plugin exactly once.
    pub fn reorder_plugins(&self, order: &[i64]) -> Result<()> {
        let mut plugins = self.plugins.write();
        if order.len() != plugins.len() {
            return Err(Error::validation("Plugin order must list every plugin once"));
        }

        let mut sorted = Vec::with_capacity(plugins.len());
        for id in order {
            let plugin = plugins
                .iter()
                .find(|p| p.id() == *id)
                .ok_or_else(|| Error::not_found("Plugin", id.to_string()))?;
            if sorted.iter().any(|p: &Arc<Plugin>| p.id() == *id) {
                return Err(Error::validation(format!("Duplicate plugin id {}", id)));
            }
            sorted.push(plugin.clone());
        }

        *plugins = sorted;
        Ok(())
    }

    /// Start every enabled locator.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        for plugin in self.plugins.read().iter().filter(|p| p.is_enabled()) {
            plugin.locator.start();
        }
        info!("Plugin manager started");
    }

    /// Stop every locator and wait for in-flight sweeps to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let plugins = self.plugins();
        join_all(plugins.iter().map(|p| p.locator.stop())).await;
        info!("Plugin manager stopped");
    }

    /// Suspend all locators at their next checkpoint.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!("Pausing all locators");
        }
        for plugin in self.plugins.read().iter() {
            plugin.locator.pause();
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!("Resuming all locators");
        }
        for plugin in self.plugins.read().iter() {
            plugin.locator.resume();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}
