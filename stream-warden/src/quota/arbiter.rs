//! Arbiter contract and shared quota bookkeeping.

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{DomainEvent, EventSink};
use crate::recorder::RecordingService;

/// Casts a boolean admission vote over one resource dimension.
pub trait Arbiter: Send + Sync {
    fn name(&self) -> &str;

    /// Current verdict: true admits new work.
    fn decision(&self) -> bool;

    /// Vote channel; changes only when the decision flips.
    fn subscribe_votes(&self) -> watch::Receiver<bool>;

    /// Detach from every event source. The decision is frozen afterwards.
    fn dispose(&self);
}

/// The part of the capture supervisor an arbiter may act on.
pub trait CaptureControl: Send + Sync {
    /// Active labels, oldest first.
    fn active_labels(&self) -> Vec<String>;

    /// Latest bitrate of a job in bytes per second.
    fn bitrate_of(&self, label: &str) -> Option<u64>;

    /// Stop a job. Returns false if there was none.
    fn stop_recording(&self, label: &str) -> bool;
}

impl CaptureControl for RecordingService {
    fn active_labels(&self) -> Vec<String> {
        RecordingService::active_labels(self)
    }

    fn bitrate_of(&self, label: &str) -> Option<u64> {
        RecordingService::bitrate_of(self, label)
    }

    fn stop_recording(&self, label: &str) -> bool {
        RecordingService::stop_recording(self, label)
    }
}

#[derive(Debug, Clone, Copy)]
struct Levels {
    usage: u64,
    quota: u64,
}

/// Usage, limit and cached decision of one arbiter.
pub(crate) struct QuotaState {
    name: &'static str,
    levels: Mutex<Levels>,
    vote: watch::Sender<bool>,
    events: EventSink,
    cancel: CancellationToken,
}

impl QuotaState {
    pub(crate) fn new(name: &'static str, quota: u64, events: EventSink) -> Self {
        let (vote, _) = watch::channel(true);
        Self {
            name,
            levels: Mutex::new(Levels { usage: 0, quota }),
            vote,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn usage(&self) -> u64 {
        self.levels.lock().usage
    }

    pub(crate) fn quota(&self) -> u64 {
        self.levels.lock().quota
    }

    pub(crate) fn decision(&self) -> bool {
        *self.vote.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.vote.subscribe()
    }

    /// Token cancelled on dispose; listener tasks select on it.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Record a new usage figure and return the recomputed decision.
    pub(crate) fn set_usage(&self, usage: u64) -> bool {
        self.apply(|levels| levels.usage = usage)
    }

    /// Record a new usage figure and return how far it exceeds the limit, if
    /// it does. Both figures come from the same snapshot.
    pub(crate) fn set_usage_overshoot(&self, usage: u64) -> Option<u64> {
        let levels = self.apply_levels(|levels| levels.usage = usage);
        levels.usage.checked_sub(levels.quota).filter(|over| *over > 0)
    }

    /// Record a new limit and return the recomputed decision.
    pub(crate) fn set_quota(&self, quota: u64) -> bool {
        self.apply(|levels| levels.quota = quota)
    }

    fn apply(&self, change: impl FnOnce(&mut Levels)) -> bool {
        let levels = self.apply_levels(change);
        levels.usage <= levels.quota
    }

    fn apply_levels(&self, change: impl FnOnce(&mut Levels)) -> Levels {
        let (before, after) = {
            let mut levels = self.levels.lock();
            let before = *levels;
            change(&mut levels);
            (before, *levels)
        };

        if before.usage != after.usage || before.quota != after.quota {
            self.events.publish(DomainEvent::QuotaChanged {
                arbiter: self.name.to_string(),
                usage: after.usage,
                quota: after.quota,
            });
        }

        let decision = after.usage <= after.quota;
        let flipped = self.vote.send_if_modified(|current| {
            if *current != decision {
                *current = decision;
                true
            } else {
                false
            }
        });
        if flipped {
            debug!(
                arbiter = self.name,
                usage = after.usage,
                quota = after.quota,
                decision,
                "Vote changed"
            );
        }
        after
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use indexmap::IndexMap;

    /// In-memory stand-in for the recording service.
    #[derive(Default)]
    pub(crate) struct FakeCaptures {
        jobs: Mutex<IndexMap<String, u64>>,
        pub stopped: Mutex<Vec<String>>,
    }

    impl FakeCaptures {
        pub(crate) fn with_jobs(jobs: &[(&str, u64)]) -> Self {
            let fake = Self::default();
            for (label, bitrate) in jobs {
                fake.jobs.lock().insert(label.to_string(), *bitrate);
            }
            fake
        }

        pub(crate) fn stopped(&self) -> Vec<String> {
            self.stopped.lock().clone()
        }
    }

    impl CaptureControl for FakeCaptures {
        fn active_labels(&self) -> Vec<String> {
            self.jobs.lock().keys().cloned().collect()
        }

        fn bitrate_of(&self, label: &str) -> Option<u64> {
            self.jobs.lock().get(label).copied()
        }

        fn stop_recording(&self, label: &str) -> bool {
            let removed = self.jobs.lock().shift_remove(label).is_some();
            if removed {
                self.stopped.lock().push(label.to_string());
            }
            removed
        }
    }

    #[test]
    fn test_vote_is_edge_triggered() {
        let events = EventSink::new();
        let mut domain = events.subscribe();
        let state = QuotaState::new("test", 2, events);
        let mut votes = state.subscribe();

        assert!(state.set_usage(1));
        assert!(!votes.has_changed().unwrap());

        assert!(!state.set_usage(3));
        assert!(votes.has_changed().unwrap());
        assert!(!*votes.borrow_and_update());

        // Still violating: no new vote.
        assert!(!state.set_usage(4));
        assert!(!votes.has_changed().unwrap());

        assert!(state.set_quota(4));
        assert!(*votes.borrow_and_update());

        let mut changes = 0;
        while let Ok(event) = domain.try_recv() {
            assert!(matches!(event, DomainEvent::QuotaChanged { .. }));
            changes += 1;
        }
        assert_eq!(changes, 4);
    }

    #[test]
    fn test_overshoot_is_measured_against_same_levels() {
        let state = QuotaState::new("test", 1000, EventSink::new());
        assert_eq!(state.set_usage_overshoot(1350), Some(350));
        assert!(!state.decision());
        assert_eq!(state.set_usage_overshoot(1000), None);
        assert!(state.decision());
        state.set_quota(0);
        assert_eq!(state.set_usage_overshoot(7), Some(7));
    }

    #[test]
    fn test_unchanged_levels_publish_nothing() {
        let events = EventSink::new();
        let mut domain = events.subscribe();
        let state = QuotaState::new("test", 2, events);
        state.set_usage(0);
        state.set_quota(2);
        assert!(domain.try_recv().is_err());
    }
}
