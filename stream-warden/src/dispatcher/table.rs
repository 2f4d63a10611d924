//! URL ownership routing.
//!
//! The [`StreamDispatcher`] keeps exactly one owner for every watched URL
//! that is not currently being recorded: either the source's active plugin
//! (its highest-priority enabled plugin) or the [`Owner::Unassigned`]
//! sentinel. Every ownership change is mirrored into the owning locator's
//! URL set so the locators poll exactly what they own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, error, info};

use super::source::{WatchedSource, source_key};
use crate::locator::Plugin;
use crate::{Error, Result};

/// Holder of a URL's poll duty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Reserved bucket for URLs with no enabled compatible plugin.
    Unassigned,
    /// A plugin, by name.
    Plugin(String),
}

impl Owner {
    pub fn plugin(name: impl Into<String>) -> Self {
        Self::Plugin(name.into())
    }

    fn of(plugin: Option<&Arc<Plugin>>) -> Self {
        match plugin {
            Some(p) => Self::Plugin(p.name().to_string()),
            None => Self::Unassigned,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => write!(f, "<unassigned>"),
            Self::Plugin(name) => write!(f, "{}", name),
        }
    }
}

/// Source registry plus the ownership table.
pub struct StreamDispatcher {
    sources: IndexMap<String, WatchedSource>,
    owners: HashMap<Owner, IndexSet<String>>,
}

impl StreamDispatcher {
    pub fn new() -> Self {
        let mut owners = HashMap::new();
        owners.insert(Owner::Unassigned, IndexSet::new());
        Self {
            sources: IndexMap::new(),
            owners,
        }
    }

    /// Create the ownership set for a plugin.
    pub fn register_owner(&mut self, plugin: &Plugin) {
        self.owners
            .entry(Owner::plugin(plugin.name()))
            .or_default();
    }

    pub fn has_owner(&self, owner: &Owner) -> bool {
        self.owners.contains_key(owner)
    }

    // ----- registry -----

    /// Register a source and assign it to its active owner.
    ///
    /// Returns whether a plugin (rather than the sentinel) took it.
    pub fn watch(&mut self, source: WatchedSource) -> Result<bool> {
        let key = source.key();
        if self.sources.contains_key(&key) {
            return Err(Error::validation(format!(
                "Source '{}' is already watched",
                source.url
            )));
        }
        let url = source.url.clone();
        self.sources.insert(key, source);
        Ok(self.add(&url))
    }

    /// Drop a source from the registry and from whichever owner holds it.
    pub fn unwatch(&mut self, url: &str) -> Option<WatchedSource> {
        let key = source_key(url);
        self.detach(&key);
        self.sources.shift_remove(&key)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.sources.contains_key(&source_key(url))
    }

    pub fn source(&self, url: &str) -> Option<&WatchedSource> {
        self.sources.get(&source_key(url))
    }

    pub fn source_mut(&mut self, url: &str) -> Option<&mut WatchedSource> {
        self.sources.get_mut(&source_key(url))
    }

    /// Watched sources in registration order.
    pub fn sources(&self) -> impl Iterator<Item = &WatchedSource> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    // ----- ownership -----

    /// The highest-priority enabled plugin for a URL.
    pub fn get_active_plugin(&self, url: &str) -> Option<Arc<Plugin>> {
        self.sources
            .get(&source_key(url))
            .and_then(|s| s.active_plugin().cloned())
    }

    /// Current owner of a URL, if it is owned at all.
    pub fn owner_of(&self, url: &str) -> Option<Owner> {
        let key = source_key(url);
        self.owners
            .iter()
            .find(|(_, keys)| keys.contains(&key))
            .map(|(owner, _)| owner.clone())
    }

    /// URLs held by an owner, in assignment order.
    pub fn owned_by(&self, owner: &Owner) -> Vec<String> {
        self.owners
            .get(owner)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.sources.get(k).map(|s| s.url.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Put a URL under its active plugin.
    ///
    /// Returns false when there is no active plugin; the URL is then parked
    /// with the sentinel so it stays accounted for.
    pub fn add(&mut self, url: &str) -> bool {
        let key = source_key(url);
        if !self.sources.contains_key(&key) {
            return false;
        }
        match self.place(&key) {
            Ok(Owner::Plugin(_)) => true,
            Ok(Owner::Unassigned) => false,
            Err(e) => {
                error!(url = %url, error = %e, "Failed to assign source");
                let _ = self.attach(&key, &Owner::Unassigned);
                false
            }
        }
    }

    /// Withdraw a URL from its owner.
    ///
    /// Returns false when no plugin owned it (a sentinel-parked URL is still
    /// withdrawn).
    pub fn remove(&mut self, url: &str) -> bool {
        matches!(self.detach(&source_key(url)), Some(Owner::Plugin(_)))
    }

    /// Reassign a URL between owners. Fails if `from` does not hold it.
    pub fn move_url(&mut self, url: &str, from: &Owner, to: &Owner) -> Result<()> {
        let key = source_key(url);
        let held = self
            .owners
            .get(from)
            .map(|keys| keys.contains(&key))
            .unwrap_or(false);
        if !held {
            return Err(Error::dispatch(format!("'{}' is not owned by {}", url, from)));
        }
        if !self.owners.contains_key(to) {
            return Err(Error::dispatch(format!("No ownership set for {}", to)));
        }
        if from == to {
            return Ok(());
        }

        self.detach(&key);
        self.attach(&key, to)?;
        debug!(url = %url, from = %from, to = %to, "Source moved");
        Ok(())
    }

    /// Re-home every URL of a plugin that was just disabled.
    ///
    /// Returns the number of URLs moved.
    pub fn redistribute_from_disabled_plugin(&mut self, plugin: &str) -> Result<usize> {
        let from = Owner::plugin(plugin);
        let keys: Vec<String> = self
            .owners
            .get(&from)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let mut moved = 0;
        for key in keys {
            let target = Owner::of(self.sources.get(&key).and_then(|s| s.active_plugin()));
            if target != from {
                let url = self.url_of(&key);
                self.move_url(&url, &from, &target)?;
                moved += 1;
            }
        }

        info!(plugin = %plugin, moved, "Redistributed sources from disabled plugin");
        Ok(moved)
    }

    /// Claim every owned URL whose active plugin is now `plugin`.
    ///
    /// Scans all owners, including the sentinel. Returns the number of URLs
    /// moved.
    pub fn redistribute_to_enabled_plugin(&mut self, plugin: &str) -> Result<usize> {
        let to = Owner::plugin(plugin);
        let candidates: Vec<(Owner, String)> = self
            .owners
            .iter()
            .filter(|(owner, _)| **owner != to)
            .flat_map(|(owner, keys)| keys.iter().map(move |k| (owner.clone(), k.clone())))
            .collect();

        let mut moved = 0;
        for (from, key) in candidates {
            let target = Owner::of(self.sources.get(&key).and_then(|s| s.active_plugin()));
            if target == to {
                let url = self.url_of(&key);
                self.move_url(&url, &from, &to)?;
                moved += 1;
            }
        }

        info!(plugin = %plugin, moved, "Redistributed sources to enabled plugin");
        Ok(moved)
    }

    /// Reorder one source's plugin list and re-home it if it is owned.
    pub fn reorder_source_plugin(&mut self, url: &str, from: usize, to: usize) -> Result<()> {
        let key = source_key(url);
        let source = self
            .sources
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("Source", url))?;
        source.reorder_plugin(from, to)?;

        if let Some(current) = self.owner_of(url) {
            let target = Owner::of(self.sources.get(&key).and_then(|s| s.active_plugin()));
            if target != current {
                let url = self.url_of(&key);
                self.move_url(&url, &current, &target)?;
            }
        }
        Ok(())
    }

    /// Assign every watched URL to its active owner.
    ///
    /// Fails if a URL resolves to a plugin without an ownership set, which
    /// means plugins were not registered before sources were loaded.
    pub fn initialize(&mut self) -> Result<()> {
        let keys: Vec<String> = self.sources.keys().cloned().collect();
        for key in keys {
            self.place(&key)?;
        }
        info!(sources = self.sources.len(), "Dispatcher initialized");
        Ok(())
    }

    // ----- internals -----

    fn url_of(&self, key: &str) -> String {
        self.sources
            .get(key)
            .map(|s| s.url.clone())
            .unwrap_or_else(|| key.to_string())
    }

    /// Move a URL to its active owner, wherever it currently is.
    fn place(&mut self, key: &str) -> Result<Owner> {
        let target = Owner::of(self.sources.get(key).and_then(|s| s.active_plugin()));
        if !self.owners.contains_key(&target) {
            return Err(Error::dispatch(format!(
                "No ownership set registered for plugin {}",
                target
            )));
        }
        self.detach(key);
        self.attach(key, &target)?;
        Ok(target)
    }

    fn locator_url(&self, key: &str, owner: &Owner) -> Option<(Arc<Plugin>, String)> {
        let Owner::Plugin(name) = owner else {
            return None;
        };
        let source = self.sources.get(key)?;
        source
            .plugin(name)
            .map(|plugin| (plugin.clone(), source.url.clone()))
    }

    fn detach(&mut self, key: &str) -> Option<Owner> {
        let owner = self
            .owners
            .iter_mut()
            .find_map(|(owner, keys)| keys.shift_remove(key).then(|| owner.clone()))?;

        if let Some((plugin, url)) = self.locator_url(key, &owner) {
            plugin.locator().remove_url(&url);
        }
        Some(owner)
    }

    fn attach(&mut self, key: &str, owner: &Owner) -> Result<()> {
        let keys = self
            .owners
            .get_mut(owner)
            .ok_or_else(|| Error::dispatch(format!("No ownership set for {}", owner)))?;
        keys.insert(key.to_string());

        if let Some((plugin, url)) = self.locator_url(key, owner) {
            plugin.locator().add_url(&url);
        }
        Ok(())
    }
}

impl Default for StreamDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
