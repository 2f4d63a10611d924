//! Concurrent capture count quota.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::arbiter::{Arbiter, CaptureControl, QuotaState};
use crate::events::EventSink;
use crate::recorder::RecordingEvent;

/// Limits the number of simultaneous captures.
///
/// On violation the most recently started excess jobs are stopped.
pub struct InstanceQuota {
    state: QuotaState,
    captures: Arc<dyn CaptureControl>,
}

impl InstanceQuota {
    pub fn new(captures: Arc<dyn CaptureControl>, quota: u64, events: EventSink) -> Self {
        Self {
            state: QuotaState::new("instance", quota, events),
            captures,
        }
    }

    /// Create the arbiter and follow the recording events.
    pub fn spawn(
        captures: Arc<dyn CaptureControl>,
        recordings: broadcast::Receiver<RecordingEvent>,
        quota: u64,
        events: EventSink,
    ) -> Arc<Self> {
        let arbiter = Arc::new(Self::new(captures, quota, events));
        super::follow(arbiter.clone(), arbiter.state.cancel_token(), recordings, |a, event| {
            a.on_recording_event(&event)
        });
        arbiter.evaluate();
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
        self.state.set_quota(quota);
        self.evaluate();
    }

    pub fn on_recording_event(&self, event: &RecordingEvent) {
        if self.state.is_disposed() {
            return;
        }
        match event {
            RecordingEvent::Started { .. }
            | RecordingEvent::Stopped { .. }
            | RecordingEvent::Completed { .. } => self.evaluate(),
            RecordingEvent::Progress { .. } => {}
        }
    }

    /// Recompute usage and stop the excess when over the limit.
    pub fn evaluate(&self) {
        let labels = self.captures.active_labels();
        if self.state.set_usage(labels.len() as u64) {
            return;
        }

        let excess = labels.len().saturating_sub(self.state.quota() as usize);
        warn!(
            active = labels.len(),
            quota = self.state.quota(),
            excess,
            "Instance quota exceeded; stopping newest captures"
        );
        for label in labels.iter().rev().take(excess) {
            if self.captures.stop_recording(label) {
                info!(label = %label, "Capture stopped by instance quota");
            }
        }

        self.state
            .set_usage(self.captures.active_labels().len() as u64);
    }
}

impl Arbiter for InstanceQuota {
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
