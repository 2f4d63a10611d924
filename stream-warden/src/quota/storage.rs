//! Archive disk usage quota.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::arbiter::{Arbiter, CaptureControl, QuotaState};
use super::monitor::StorageSnapshot;
use crate::events::EventSink;

/// Limits the bytes held in the archive directory.
///
/// Usage comes from the disk usage monitor. Stopping captures cannot shrink
/// finished files, so a violation stops every active job at once.
pub struct StorageQuota {
    state: QuotaState,
    captures: Arc<dyn CaptureControl>,
}

impl StorageQuota {
    pub fn new(captures: Arc<dyn CaptureControl>, quota: u64, events: EventSink) -> Self {
        Self {
            state: QuotaState::new("storage", quota, events),
            captures,
        }
    }

    /// Create the arbiter and follow the monitor's snapshots.
    pub fn spawn(
        captures: Arc<dyn CaptureControl>,
        mut snapshots: watch::Receiver<StorageSnapshot>,
        quota: u64,
        events: EventSink,
    ) -> Arc<Self> {
        let arbiter = Arc::new(Self::new(captures, quota, events));
        let cancel = arbiter.state.cancel_token();
        let task_arbiter = arbiter.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let used = snapshots.borrow_and_update().used_bytes;
                        task_arbiter.on_usage(used);
                    }
                }
            }
        });

        arbiter
    }

    pub fn usage(&self) -> u64 {
        self.state.usage()
    }

    pub fn quota(&self) -> u64 {
        self.state.quota()
    }

    pub fn set_quota(&self, quota: u64) {
        if self.state.is_disposed() {
            return;
        }
        if !self.state.set_quota(quota) {
            self.enforce();
        }
    }

    /// Feed a measured usage figure.
    pub fn on_usage(&self, used_bytes: u64) {
        if self.state.is_disposed() {
            return;
        }
        if !self.state.set_usage(used_bytes) {
            self.enforce();
        }
    }

    fn enforce(&self) {
        let labels = self.captures.active_labels();
        if labels.is_empty() {
            return;
        }
        warn!(
            usage = self.state.usage(),
            quota = self.state.quota(),
            active = labels.len(),
            "Storage quota exceeded; stopping all captures"
        );
        for label in &labels {
            if self.captures.stop_recording(label) {
                info!(label = %label, "Capture stopped by storage quota");
            }
        }
    }
}

impl Arbiter for StorageQuota {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn decision(&self) -> bool {
        self.state.decision()
    }

    fn subscribe_votes(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn dispose(&self) {
        self.state.dispose();
    }
}
