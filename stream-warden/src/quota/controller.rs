//! Pipeline pause/resume driven by arbiter votes.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::arbiter::Arbiter;
use crate::events::{DomainEvent, EventSink};
use crate::locator::PluginManager;
use crate::{Error, Result};

struct Registered {
    arbiter: Arc<dyn Arbiter>,
    watcher: JoinHandle<()>,
}

/// Pauses every locator while any registered arbiter votes false.
///
/// Decisions are folded with logical AND; an empty set admits.
pub struct PluginManagerController {
    manager: Arc<PluginManager>,
    events: EventSink,
    arbiters: Mutex<IndexMap<String, Registered>>,
    /// Serializes read-decide-apply so a stale verdict cannot land last.
    transition: Mutex<()>,
}

impl PluginManagerController {
    pub fn new(manager: Arc<PluginManager>, events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            manager,
            events,
            arbiters: Mutex::new(IndexMap::new()),
            transition: Mutex::new(()),
        })
    }

    /// Register an arbiter under `id` and react to its vote changes.
    pub fn add_arbiter(self: &Arc<Self>, id: impl Into<String>, arbiter: Arc<dyn Arbiter>) -> Result<()> {
        let id = id.into();
        let mut arbiters = self.arbiters.lock();
        if arbiters.contains_key(&id) {
            return Err(Error::validation(format!("Arbiter '{}' is already registered", id)));
        }

        let mut votes = arbiter.subscribe_votes();
        let controller: Weak<Self> = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            while votes.changed().await.is_ok() {
                match controller.upgrade() {
                    Some(controller) => controller.aggregate(),
                    None => break,
                }
            }
        });

        info!(arbiter = %id, name = arbiter.name(), "Arbiter registered");
        arbiters.insert(id, Registered { arbiter, watcher });
        drop(arbiters);

        self.aggregate();
        Ok(())
    }

    /// Unregister and dispose an arbiter. Returns false if unknown.
    pub fn remove_arbiter(&self, id: &str) -> bool {
        let Some(registered) = self.arbiters.lock().shift_remove(id) else {
            return false;
        };
        registered.watcher.abort();
        registered.arbiter.dispose();
        info!(arbiter = %id, "Arbiter removed");

        self.aggregate();
        true
    }

    pub fn arbiter_ids(&self) -> Vec<String> {
        self.arbiters.lock().keys().cloned().collect()
    }

    /// Current AND of all decisions.
    pub fn decision(&self) -> bool {
        self.arbiters.lock().values().all(|r| r.arbiter.decision())
    }

    /// Recompute the aggregate and pause or resume the plugin manager.
    pub fn aggregate(&self) {
        let _transition = self.transition.lock();
        let admit = self.decision();
        let was_paused = self.manager.is_paused();

        if admit {
            self.manager.resume();
            if was_paused {
                info!("All arbiters admit; resuming locators");
                self.events.publish(DomainEvent::PipelineResumed);
            }
        } else {
            self.manager.pause();
            if !was_paused {
                info!("An arbiter refused; pausing locators");
                self.events.publish(DomainEvent::PipelinePaused);
            }
        }
        debug!(admit, "Arbiter votes aggregated");
    }

    /// Dispose every arbiter and stop watching votes.
    pub fn dispose(&self) {
        let drained: Vec<(String, Registered)> = self.arbiters.lock().drain(..).collect();
        for (id, registered) in drained {
            registered.watcher.abort();
            registered.arbiter.dispose();
            debug!(arbiter = %id, "Arbiter disposed");
        }
    }
}

impl Drop for PluginManagerController {
    fn drop(&mut self) {
        for registered in self.arbiters.get_mut().values() {
            registered.watcher.abort();
        }
    }
}
