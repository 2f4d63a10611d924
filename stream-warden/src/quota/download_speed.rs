//! Aggregate capture bandwidth quota.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::arbiter::{Arbiter, CaptureControl, QuotaState};
use crate::events::EventSink;
use crate::recorder::RecordingEvent;

/// Labels whose last bitrate is remembered for admission estimates.
const BITRATE_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Limits the summed bitrate of all active captures (bytes per second).
///
/// On violation a single job is stopped: the one whose bitrate covers the
/// deficit with the least over-drop.
pub struct DownloadSpeedQuota {
    state: QuotaState,
    captures: Arc<dyn CaptureControl>,
    last_bitrates: Mutex<LruCache<String, u64>>,
}

/// Pick the job to stop for a bandwidth deficit.
///
/// An exact match wins outright. Otherwise the smallest non-negative
/// `bitrate - deficit` wins. When every job undershoots, the first job is
/// chosen.
pub fn select_victim(jobs: &[(String, u64)], deficit: u64) -> Option<&str> {
    let (first, _) = jobs.first()?;
    let mut victim = first.as_str();
    let mut best: Option<i128> = None;

    for (label, bitrate) in jobs {
        let score = *bitrate as i128 - deficit as i128;
        if score == 0 {
            return Some(label);
        }
        if score > 0 && best.is_none_or(|b| score < b) {
            best = Some(score);
            victim = label;
        }
    }

    Some(victim)
}

impl DownloadSpeedQuota {
    pub fn new(captures: Arc<dyn CaptureControl>, quota: u64, events: EventSink) -> Self {
        Self {
            state: QuotaState::new("download_speed", quota, events),
            captures,
            last_bitrates: Mutex::new(LruCache::new(BITRATE_CACHE_CAPACITY)),
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

    /// Whether starting `label` would keep usage within the quota, based on
    /// its last observed bitrate (zero if never seen).
    pub fn estimate_admission(&self, label: &str) -> bool {
        let expected = self.last_bitrates.lock().peek(label).copied().unwrap_or(0);
        self.state.usage().saturating_add(expected) <= self.state.quota()
    }

    /// Last bitrate remembered for a label.
    pub fn last_bitrate(&self, label: &str) -> Option<u64> {
        self.last_bitrates.lock().peek(label).copied()
    }

    pub fn on_recording_event(&self, event: &RecordingEvent) {
        if self.state.is_disposed() {
            return;
        }
        match event {
            RecordingEvent::Progress { label, progress } => {
                self.last_bitrates.lock().put(label.clone(), progress.bitrate);
                self.evaluate();
            }
            RecordingEvent::Started { .. }
            | RecordingEvent::Stopped { .. }
            | RecordingEvent::Completed { .. } => self.evaluate(),
        }
    }

    fn active_bitrates(&self) -> Vec<(String, u64)> {
        self.captures
            .active_labels()
            .into_iter()
            .map(|label| {
                let bitrate = self.captures.bitrate_of(&label).unwrap_or(0);
                (label, bitrate)
            })
            .collect()
    }

    /// Recompute usage and stop one job when over the limit.
    pub fn evaluate(&self) {
        let jobs = self.active_bitrates();
        let usage: u64 = jobs.iter().map(|(_, b)| b).sum();
        let Some(deficit) = self.state.set_usage_overshoot(usage) else {
            return;
        };
        let Some(victim) = select_victim(&jobs, deficit) else {
            return;
        };
        warn!(
            usage,
            deficit,
            victim = %victim,
            "Download speed quota exceeded; stopping one capture"
        );
        if self.captures.stop_recording(victim) {
            info!(label = %victim, "Capture stopped by download speed quota");
        }

        let usage = self.active_bitrates().iter().map(|(_, b)| b).sum();
        self.state.set_usage(usage);
    }
}

impl Arbiter for DownloadSpeedQuota {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::arbiter::tests::FakeCaptures;
    use crate::recorder::CaptureProgress;

    fn jobs(list: &[(&str, u64)]) -> Vec<(String, u64)> {
        list.iter().map(|(l, b)| (l.to_string(), *b)).collect()
    }

    #[test]
    fn test_select_smallest_non_negative_score() {
        let jobs = jobs(&[("a", 400), ("b", 650), ("c", 300)]);
        assert_eq!(select_victim(&jobs, 350), Some("a"));
    }

    #[test]
    fn test_select_exact_match_wins() {
        let jobs = jobs(&[("a", 400), ("b", 350), ("c", 360)]);
        assert_eq!(select_victim(&jobs, 350), Some("b"));
    }

    #[test]
    fn test_select_falls_back_to_first_job() {
        let jobs = jobs(&[("a", 100), ("b", 300), ("c", 200)]);
        assert_eq!(select_victim(&jobs, 350), Some("a"));
        assert_eq!(select_victim(&[], 350), None);
    }

    #[test]
    fn test_violation_stops_best_match() {
        let captures = Arc::new(FakeCaptures::with_jobs(&[("a", 400), ("b", 650), ("c", 300)]));
        let quota = DownloadSpeedQuota::new(captures.clone(), 1000, EventSink::new());

        quota.evaluate();

        assert_eq!(captures.stopped(), vec!["a"]);
        assert_eq!(quota.usage(), 950);
        assert!(quota.decision());
    }

    /// Jobs that ignore stop requests, so usage stays over any small quota.
    struct StubbornCaptures;

    impl CaptureControl for StubbornCaptures {
        fn active_labels(&self) -> Vec<String> {
            vec!["a".to_string(), "b".to_string()]
        }

        fn bitrate_of(&self, _label: &str) -> Option<u64> {
            Some(500)
        }

        fn stop_recording(&self, _label: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_evaluate_tolerates_concurrent_quota_changes() {
        let quota = DownloadSpeedQuota::new(Arc::new(StubbornCaptures), 100, EventSink::new());
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..20_000u64 {
                    quota.state.set_quota(if i % 2 == 0 { 100 } else { 5_000 });
                }
            });
            for _ in 0..20_000 {
                quota.evaluate();
            }
        });
        assert_eq!(quota.usage(), 1000);
    }

    #[test]
    fn test_progress_feeds_cache_and_estimate() {
        let captures = Arc::new(FakeCaptures::with_jobs(&[("a", 600)]));
        let quota = DownloadSpeedQuota::new(captures.clone(), 1000, EventSink::new());

        quota.on_recording_event(&RecordingEvent::Progress {
            label: "b".into(),
            progress: CaptureProgress {
                bitrate: 500,
                ..Default::default()
            },
        });
        assert_eq!(quota.usage(), 600);
        assert_eq!(quota.last_bitrate("b"), Some(500));

        assert!(!quota.estimate_admission("b"));
        assert!(quota.estimate_admission("never-seen"));
        assert!(captures.stopped().is_empty());
    }

    #[test]
    fn test_cache_is_bounded() {
        let captures = Arc::new(FakeCaptures::default());
        let quota = DownloadSpeedQuota::new(captures, u64::MAX, EventSink::new());
        for i in 0..150 {
            quota.on_recording_event(&RecordingEvent::Progress {
                label: format!("l{}", i),
                progress: CaptureProgress {
                    bitrate: i,
                    ..Default::default()
                },
            });
        }
        assert_eq!(quota.last_bitrate("l0"), None);
        assert_eq!(quota.last_bitrate("l149"), Some(149));
        assert_eq!(quota.last_bitrates.lock().len(), 100);
    }
}
