//! Locator service: periodic liveness polling for one source family.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extractor::StreamExtractor;
use crate::task::{ExecutionFence, RecurringTask, Task, TaskState};
use crate::{Error, Result};

/// Capacity of each locator's live event channel.
const LIVE_CHANNEL_CAPACITY: usize = 64;

/// A watched URL was found live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEvent {
    /// The watched URL.
    pub url: String,
    /// Resolved capture address.
    pub address: String,
    /// Name of the plugin that detected it.
    pub plugin: String,
}

/// One sweep over the owned URLs.
struct Sweeper {
    name: String,
    extractor: Arc<dyn StreamExtractor>,
    urls: RwLock<IndexSet<String>>,
    fence: ExecutionFence,
    /// Ordered fan-out targets; index 0 is the locator's own channel.
    sinks: RwLock<Vec<broadcast::Sender<LiveEvent>>>,
}

impl Sweeper {
    fn owns(&self, url: &str) -> bool {
        self.urls.read().contains(url)
    }

    fn emit(&self, event: LiveEvent) {
        for sink in self.sinks.read().iter() {
            // No receivers is fine.
            let _ = sink.send(event.clone());
        }
    }
}

#[async_trait]
impl Task for Sweeper {
    async fn run(&self, stop: &CancellationToken) -> Result<()> {
        let urls: Vec<String> = self.urls.read().iter().cloned().collect();
        debug!(plugin = %self.name, count = urls.len(), "Sweep started");

        for url in urls {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(plugin = %self.name, "Sweep cut short by stop");
                    return Ok(());
                }
                _ = self.fence.fence() => {}
            }

            // Withdrawn while we were paused or resolving an earlier URL.
            if !self.owns(&url) {
                continue;
            }

            match self.extractor.extract(&url).await {
                Ok(Some(address)) => {
                    if self.owns(&url) {
                        info!(plugin = %self.name, url = %url, "Source is live");
                        self.emit(LiveEvent {
                            url,
                            address,
                            plugin: self.name.clone(),
                        });
                    }
                }
                Ok(None) => {
                    debug!(plugin = %self.name, url = %url, "Source is offline");
                }
                Err(e) => {
                    warn!(plugin = %self.name, url = %url, error = %e, "Failed to resolve source");
                }
            }
        }

        Ok(())
    }

    fn on_abort(&self, error: &Error) {
        error!(plugin = %self.name, error = %error, "Locator aborted; restart required");
    }
}

/// Polls the URLs assigned to one plugin and emits [`LiveEvent`]s.
pub struct LocatorService {
    runner: RecurringTask<Sweeper>,
}

impl LocatorService {
    pub fn new(
        name: impl Into<String>,
        extractor: Arc<dyn StreamExtractor>,
        interval: Duration,
    ) -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let sweeper = Sweeper {
            name: name.into(),
            extractor,
            urls: RwLock::new(IndexSet::new()),
            fence: ExecutionFence::new(),
            sinks: RwLock::new(vec![live_tx]),
        };
        Self {
            runner: RecurringTask::new(Arc::new(sweeper), interval),
        }
    }

    fn sweeper(&self) -> &Arc<Sweeper> {
        self.runner.task()
    }

    pub fn name(&self) -> &str {
        &self.sweeper().name
    }

    pub fn interval(&self) -> Duration {
        self.runner.delay()
    }

    pub fn can_parse(&self, url: &str) -> bool {
        self.sweeper().extractor.can_parse(url)
    }

    /// Assign a URL to this locator. Returns false if already owned.
    pub fn add_url(&self, url: &str) -> bool {
        self.sweeper().urls.write().insert(url.to_string())
    }

    /// Withdraw a URL. Returns false if it was not owned.
    pub fn remove_url(&self, url: &str) -> bool {
        self.sweeper().urls.write().shift_remove(url)
    }

    pub fn owns(&self, url: &str) -> bool {
        self.sweeper().owns(url)
    }

    /// Owned URLs in assignment order.
    pub fn urls(&self) -> Vec<String> {
        self.sweeper().urls.read().iter().cloned().collect()
    }

    /// Subscribe to this locator's live events.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sweeper().sinks.read()[0].subscribe()
    }

    /// Forward live events to an additional channel.
    pub fn connect(&self, sink: broadcast::Sender<LiveEvent>) {
        self.sweeper().sinks.write().push(sink);
    }

    pub fn start(&self) {
        self.runner.start();
    }

    /// Stop polling; resolves after an in-flight sweep finishes.
    pub async fn stop(&self) {
        self.runner.stop().await;
    }

    /// Suspend the sweep at the next URL boundary without touching the timer.
    pub fn pause(&self) {
        self.sweeper().fence.pause();
    }

    pub fn resume(&self) {
        self.sweeper().fence.resume();
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.sweeper().fence.is_paused()
    }

    pub fn state(&self) -> TaskState {
        self.runner.state()
    }

    /// Run a single sweep outside the timer.
    pub async fn sweep_now(&self) -> Result<()> {
        self.sweeper().run(&CancellationToken::new()).await
    }
}

impl std::fmt::Debug for LocatorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorService")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Extractor with scripted answers per URL.
    pub(crate) struct ScriptedExtractor {
        prefix: String,
        live: RwLock<HashSet<String>>,
        failing: RwLock<HashSet<String>>,
        pub calls: AtomicUsize,
        pub seen: RwLock<Vec<String>>,
    }

    impl ScriptedExtractor {
        pub(crate) fn new(prefix: &str) -> Self {
            Self {
                prefix: prefix.to_string(),
                live: RwLock::new(HashSet::new()),
                failing: RwLock::new(HashSet::new()),
                calls: AtomicUsize::new(0),
                seen: RwLock::new(Vec::new()),
            }
        }

        pub(crate) fn set_live(&self, url: &str) {
            self.live.write().insert(url.to_string());
        }

        pub(crate) fn set_failing(&self, url: &str) {
            self.failing.write().insert(url.to_string());
        }
    }

    #[async_trait]
    impl StreamExtractor for ScriptedExtractor {
        fn can_parse(&self, url: &str) -> bool {
            url.starts_with(&self.prefix)
        }

        async fn extract(&self, url: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.write().push(url.to_string());
            tokio::task::yield_now().await;
            if self.failing.read().contains(url) {
                return Err(Error::extractor("connection reset"));
            }
            if self.live.read().contains(url) {
                return Ok(Some(format!("{}/stream.m3u8", url)));
            }
            Ok(None)
        }
    }

    fn locator(extractor: Arc<ScriptedExtractor>) -> LocatorService {
        LocatorService::new("scripted", extractor, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_sweep_emits_live_events_and_survives_failures() {
        let extractor = Arc::new(ScriptedExtractor::new("https://a.tv/"));
        extractor.set_failing("https://a.tv/broken");
        extractor.set_live("https://a.tv/live");
        let locator = locator(extractor.clone());
        let mut rx = locator.subscribe();

        locator.add_url("https://a.tv/broken");
        locator.add_url("https://a.tv/offline");
        locator.add_url("https://a.tv/live");

        locator.sweep_now().await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.url, "https://a.tv/live");
        assert_eq!(event.address, "https://a.tv/live/stream.m3u8");
        assert_eq!(event.plugin, "scripted");
        assert!(rx.try_recv().is_err());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connected_sinks_receive_events_in_order() {
        let extractor = Arc::new(ScriptedExtractor::new("https://a.tv/"));
        extractor.set_live("https://a.tv/live");
        let locator = locator(extractor);
        let (manager_tx, mut manager_rx) = broadcast::channel(8);
        locator.connect(manager_tx);
        locator.add_url("https://a.tv/live");

        locator.sweep_now().await.unwrap();
        assert_eq!(manager_rx.try_recv().unwrap().url, "https://a.tv/live");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_takes_effect_between_urls() {
        let extractor = Arc::new(ScriptedExtractor::new("https://a.tv/"));
        let locator = Arc::new(locator(extractor.clone()));
        for i in 0..3 {
            locator.add_url(&format!("https://a.tv/{}", i));
        }

        locator.pause();
        let sweep = {
            let locator = locator.clone();
            tokio::spawn(async move { locator.sweep_now().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

        // Removing a URL while paused skips it once resumed.
        locator.remove_url("https://a.tv/1");
        locator.resume();
        sweep.await.unwrap().unwrap();

        let seen = extractor.seen.read().clone();
        assert_eq!(seen, vec!["https://a.tv/0", "https://a.tv/2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_timer_running() {
        let extractor = Arc::new(ScriptedExtractor::new("https://a.tv/"));
        let locator = locator(extractor.clone());
        locator.add_url("https://a.tv/0");
        locator.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        locator.pause();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert!(locator.is_running());

        locator.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        locator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_paused_ends_blocked_sweep() {
        let extractor = Arc::new(ScriptedExtractor::new("https://a.tv/"));
        let locator = locator(extractor.clone());
        locator.add_url("https://a.tv/0");
        locator.pause();
        locator.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(60), locator.stop())
            .await
            .expect("stop must not wait for a fenced sweep");
        assert_eq!(locator.state(), TaskState::Stopped);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

        // Still paused after a restart; resuming lets the sweep through.
        locator.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        locator.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        locator.stop().await;
    }

    #[test]
    fn test_url_set_membership() {
        let extractor = Arc::new(ScriptedExtractor::new("https://a.tv/"));
        let locator = locator(extractor);
        assert!(locator.add_url("https://a.tv/x"));
        assert!(!locator.add_url("https://a.tv/x"));
        assert!(locator.owns("https://a.tv/x"));
        assert!(locator.remove_url("https://a.tv/x"));
        assert!(!locator.remove_url("https://a.tv/x"));
        assert!(locator.urls().is_empty());
        assert!(locator.can_parse("https://a.tv/y"));
        assert!(!locator.can_parse("https://b.tv/y"));
    }
}
