//! Warden service: listeners, mutations and rehydration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::snapshot::{PluginView, QuotaView, RestoreSummary, SourceView, WardenSnapshot};
use crate::database::{ArchiveRecord, NewArchiveRecord, Persistence};
use crate::dispatcher::{StreamDispatcher, WatchedSource};
use crate::events::{DomainEvent, EventSink};
use crate::locator::{LiveEvent, LocatorService, Plugin, PluginManager};
use crate::notification::Notifier;
use crate::quota::{
    Arbiter, CaptureControl, DiskUsageMonitor, DownloadSpeedQuota, InstanceQuota, PluginManagerController,
    StorageQuota,
};
use crate::recorder::{RecordingEvent, RecordingService};
use crate::utils::fs;
use crate::{Error, Result};

/// Extra time granted on shutdown beyond the recorder's quit timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Longest label fragment used in output file names.
const MAX_FILE_STEM: usize = 80;

/// Quota limits. 0 leaves a quota out entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub instances: u64,
    pub storage_bytes: u64,
    pub download_speed: u64,
}

/// Collaborators the warden is built from.
pub struct WardenParts {
    pub manager: Arc<PluginManager>,
    pub recorder: RecordingService,
    pub persistence: Arc<dyn Persistence>,
    pub notifier: Arc<dyn Notifier>,
    pub events: EventSink,
    /// Where captures are written while in progress.
    pub recording_dir: PathBuf,
    pub disk_check_interval: Duration,
    pub quotas: QuotaLimits,
}

#[derive(Default)]
struct Arbiters {
    instance: Option<Arc<InstanceQuota>>,
    storage: Option<Arc<StorageQuota>>,
    download_speed: Option<Arc<DownloadSpeedQuota>>,
}

/// Build a capture file name: the label reduced to safe characters plus a
/// UTC timestamp.
pub fn output_file_name(label: &str, at: chrono::DateTime<Utc>) -> String {
    let stem: String = label
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(MAX_FILE_STEM)
        .collect();
    let stem = stem.trim_matches('_');
    let stem = if stem.is_empty() { "capture" } else { stem };
    format!("{}-{}.ts", stem, at.format("%Y%m%d-%H%M%S"))
}

/// The application service.
pub struct Warden {
    manager: Arc<PluginManager>,
    dispatcher: Mutex<StreamDispatcher>,
    recorder: RecordingService,
    persistence: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
    events: EventSink,
    controller: Arc<PluginManagerController>,
    monitor: DiskUsageMonitor,
    arbiters: Arbiters,
    /// Archive records by id.
    archives: Mutex<IndexMap<i64, ArchiveRecord>>,
    recording_dir: PathBuf,
    cancel: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Warden {
    /// Build the warden and install the configured quotas.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(parts: WardenParts) -> Result<Arc<Self>> {
        let WardenParts {
            manager,
            recorder,
            persistence,
            notifier,
            events,
            recording_dir,
            disk_check_interval,
            quotas,
        } = parts;

        let mut dispatcher = StreamDispatcher::new();
        for plugin in manager.plugins() {
            dispatcher.register_owner(&plugin);
        }

        let monitor = DiskUsageMonitor::new(recorder.config().archive_dir.clone(), disk_check_interval);
        let controller = PluginManagerController::new(manager.clone(), events.clone());
        let captures: Arc<dyn CaptureControl> = Arc::new(recorder.clone());

        let mut arbiters = Arbiters::default();
        if quotas.instances > 0 {
            let arbiter = InstanceQuota::spawn(
                captures.clone(),
                recorder.subscribe(),
                quotas.instances,
                events.clone(),
            );
            controller.add_arbiter("instance", arbiter.clone())?;
            arbiters.instance = Some(arbiter);
        }
        if quotas.storage_bytes > 0 {
            let arbiter = StorageQuota::spawn(
                captures.clone(),
                monitor.subscribe(),
                quotas.storage_bytes,
                events.clone(),
            );
            controller.add_arbiter("storage", arbiter.clone())?;
            arbiters.storage = Some(arbiter);
        }
        if quotas.download_speed > 0 {
            let arbiter = DownloadSpeedQuota::spawn(
                captures,
                recorder.subscribe(),
                quotas.download_speed,
                events.clone(),
            );
            controller.add_arbiter("download_speed", arbiter.clone())?;
            arbiters.download_speed = Some(arbiter);
        }

        Ok(Arc::new(Self {
            manager,
            dispatcher: Mutex::new(dispatcher),
            recorder,
            persistence,
            notifier,
            events,
            controller,
            monitor,
            arbiters,
            archives: Mutex::new(IndexMap::new()),
            recording_dir,
            cancel: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn recorder(&self) -> &RecordingService {
        &self.recorder
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn controller(&self) -> &Arc<PluginManagerController> {
        &self.controller
    }

    pub fn download_speed_quota(&self) -> Option<&Arc<DownloadSpeedQuota>> {
        self.arbiters.download_speed.as_ref()
    }

    /// Register a plugin with the manager and give it an ownership set.
    pub fn register_plugin(&self, name: &str, locator: Arc<LocatorService>) -> Result<Arc<Plugin>> {
        let plugin = self.manager.register(name, locator)?;
        self.dispatcher.lock().register_owner(&plugin);
        Ok(plugin)
    }

    // ----- lifecycle -----

    /// Rehydrate plugins, sources and archive records from persistence.
    pub async fn restore(&self) -> Result<RestoreSummary> {
        // Plugins: ids, enablement, then priority order.
        for plugin in self.manager.plugins() {
            let row = self.persistence.upsert_plugin(plugin.name()).await?;
            self.manager.assign_id(&row.name, row.id)?;
            if !row.enabled {
                self.manager.enable_plugin(row.id, false).await?;
            }
        }
        let registered: HashSet<String> = self
            .manager
            .plugins()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        let order: Vec<i64> = self
            .persistence
            .fetch_plugins()
            .await?
            .into_iter()
            .filter(|row| registered.contains(&row.name))
            .map(|row| row.id)
            .collect();
        self.manager.reorder_plugins(&order)?;

        // Sources: persisted plugin order first, newly compatible plugins after.
        let rows = self.persistence.fetch_sources().await?;
        let mut restored = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut compatible = self.manager.find_compatible_plugins(&row.url);
            let mut plugins = Vec::with_capacity(compatible.len());
            for name in row.plugin_names()? {
                if let Some(pos) = compatible.iter().position(|p| p.name() == name) {
                    plugins.push(compatible.remove(pos));
                }
            }
            plugins.extend(compatible);

            let mut source = WatchedSource::new(row.url.clone(), plugins);
            source.last_seen_at = row.last_seen();
            source.last_known_bitrate = row.last_known_bitrate.map(|b| b.max(0) as u64);
            restored.push(source);
        }

        let sources = {
            let mut dispatcher = self.dispatcher.lock();
            for plugin in self.manager.plugins() {
                dispatcher.register_owner(&plugin);
            }
            for source in restored {
                if dispatcher.contains(&source.url) {
                    continue;
                }
                dispatcher.watch(source)?;
            }
            dispatcher.initialize()?;
            dispatcher.len()
        };

        let records = self.persistence.fetch_archive_records().await?;
        let archives = {
            let mut archives = self.archives.lock();
            archives.clear();
            archives.extend(records.into_iter().map(|r| (r.id, r)));
            archives.len()
        };

        let summary = RestoreSummary {
            plugins: registered.len(),
            sources,
            archives,
        };
        info!(
            plugins = summary.plugins,
            sources = summary.sources,
            archives = summary.archives,
            "State restored"
        );
        Ok(summary)
    }

    /// Start listeners, the disk monitor and the enabled locators.
    pub fn start(self: &Arc<Self>) {
        let mut listeners = self.listeners.lock();
        if !listeners.is_empty() {
            return;
        }

        listeners.push(tokio::spawn(Self::listen_live(
            self.clone(),
            self.manager.subscribe(),
        )));
        listeners.push(tokio::spawn(Self::listen_recordings(
            self.clone(),
            self.recorder.subscribe(),
        )));
        listeners.push(tokio::spawn(Self::listen_domain(
            self.clone(),
            self.events.subscribe(),
        )));
        drop(listeners);

        self.monitor.start();
        self.manager.start();
        info!("Warden started");
    }

    /// Stop polling, finish active captures and detach the listeners.
    pub async fn stop(&self) {
        self.manager.stop().await;
        self.monitor.stop().await;

        let mut completions = self.recorder.subscribe();
        let mut pending: HashSet<String> = self.recorder.active_labels().into_iter().collect();
        let stopped = self.recorder.stop_all();
        if stopped > 0 {
            info!(count = stopped, "Waiting for captures to finish");
            let wait = self.recorder.config().quit_timeout + SHUTDOWN_GRACE;
            let drained = tokio::time::timeout(wait, async {
                while !pending.is_empty() {
                    match completions.recv().await {
                        Ok(RecordingEvent::Completed { label, .. }) => {
                            pending.remove(&label);
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("Some captures did not report completion before shutdown");
            }
        }

        self.cancel.cancel();
        let listeners: Vec<JoinHandle<()>> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            let _ = listener.await;
        }
        self.controller.dispose();
        info!("Warden stopped");
    }

    // ----- listeners -----

    async fn listen_live(self: Arc<Self>, mut rx: broadcast::Receiver<LiveEvent>) {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => self.on_live(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Live listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn listen_recordings(self: Arc<Self>, mut rx: broadcast::Receiver<RecordingEvent>) {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => self.on_recording_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Recording listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn listen_domain(self: Arc<Self>, mut rx: broadcast::Receiver<DomainEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(DomainEvent::PipelinePaused) => {
                        self.notifier.notify_all(json!({
                            "event": "pipeline_paused",
                            "active_captures": self.recorder.active_labels(),
                        }));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    /// A watched source went live: withdraw it from polling and capture it.
    pub async fn on_live(&self, event: LiveEvent) {
        let at = Utc::now();
        let label = {
            let mut dispatcher = self.dispatcher.lock();
            let Some(source) = dispatcher.source_mut(&event.url) else {
                debug!(url = %event.url, "Live event for an unwatched source");
                return;
            };
            source.last_seen_at = Some(at);
            let label = source.url.clone();
            dispatcher.remove(&label);
            label
        };

        if let Err(e) = self.persistence.update_last_seen(&label, at).await {
            warn!(url = %label, error = %e, "Failed to persist last seen time");
        }
        self.events.publish(DomainEvent::LastSeenUpdated {
            url: label.clone(),
            at,
        });
        self.notifier.notify_by_category(
            json!({
                "url": label,
                "plugin": event.plugin,
                "address": event.address,
            }),
            "live",
        );

        if let Some(quota) = &self.arbiters.download_speed
            && !quota.estimate_admission(&label)
        {
            info!(url = %label, "Capture deferred by download speed quota");
            self.return_to_dispatch(&label);
            return;
        }

        if let Err(e) = self.begin_capture(&label, &event.address).await {
            warn!(url = %label, error = %e, "Failed to start capture");
            self.return_to_dispatch(&label);
        }
    }

    async fn begin_capture(&self, label: &str, address: &str) -> Result<bool> {
        let output = self.recording_dir.join(output_file_name(label, Utc::now()));
        self.recorder.start_recording(label, address, output).await
    }

    fn return_to_dispatch(&self, label: &str) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.contains(label) && !self.recorder.is_recording(label) {
            dispatcher.add(label);
        }
    }

    async fn on_recording_event(&self, event: RecordingEvent) {
        match event {
            RecordingEvent::Started { label, output_path } => {
                self.events.publish(DomainEvent::RecordingStarted { label, output_path });
            }
            RecordingEvent::Progress { label, progress } => {
                if let Some(source) = self.dispatcher.lock().source_mut(&label) {
                    source.last_known_bitrate = Some(progress.bitrate);
                }
                self.events
                    .publish(DomainEvent::RecordingProgress { label, progress });
            }
            RecordingEvent::Stopped { label } => {
                debug!(label = %label, "Capture withdrawn; waiting for exit");
            }
            RecordingEvent::Completed {
                label,
                path,
                size_bytes,
                duration_secs,
                exit_code,
                ..
            } => {
                self.on_completed(&label, &path, size_bytes, duration_secs, exit_code)
                    .await;
            }
        }
    }

    /// A capture process exited: record the archive and resume polling.
    async fn on_completed(
        &self,
        label: &str,
        path: &Path,
        size_bytes: u64,
        duration_secs: f64,
        exit_code: Option<i32>,
    ) {
        self.return_to_dispatch(label);
        self.events.publish(DomainEvent::RecordingRemoved {
            label: label.to_string(),
        });

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let record = NewArchiveRecord {
                label: label.to_string(),
                path: path.to_string_lossy().into_owned(),
                size_bytes: size_bytes.min(i64::MAX as u64) as i64,
                duration_secs,
            };
            match self.persistence.add_archive_record(&record).await {
                Ok(record) => {
                    self.archives.lock().insert(record.id, record.clone());
                    self.events.publish(DomainEvent::ArchiveRecordAdded { record });
                }
                Err(e) => warn!(label = %label, error = %e, "Failed to record archive"),
            }
        } else {
            debug!(label = %label, exit_code = ?exit_code, "Capture produced no file");
        }
    }

    // ----- mutations -----

    /// Watch a new URL. Persisted first, then applied in memory.
    pub async fn add_source(&self, url: &str) -> Result<SourceView> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::validation("Source URL must not be empty"));
        }
        if self.dispatcher.lock().contains(url) {
            return Err(Error::validation(format!("Source '{}' is already watched", url)));
        }

        let plugins = self.manager.find_compatible_plugins(url);
        let names: Vec<String> = plugins.iter().map(|p| p.name().to_string()).collect();
        self.persistence.add_source(url, &names).await?;

        let view = {
            let mut dispatcher = self.dispatcher.lock();
            dispatcher.watch(WatchedSource::new(url, plugins))?;
            self.view_of(&dispatcher, url)
        };
        info!(url = %url, plugins = ?names, "Source added");
        self.events.publish(DomainEvent::SourceAdded {
            url: url.to_string(),
            plugins: names,
        });
        view.ok_or_else(|| Error::not_found("Source", url))
    }

    /// Stop watching a URL, ending its capture if one is running.
    pub async fn remove_source(&self, url: &str) -> Result<()> {
        let stored = self
            .dispatcher
            .lock()
            .source(url)
            .map(|s| s.url.clone())
            .ok_or_else(|| Error::not_found("Source", url))?;

        self.persistence.remove_source(&stored).await?;
        self.dispatcher.lock().unwatch(&stored);
        self.recorder.stop_recording(&stored);

        info!(url = %stored, "Source removed");
        self.events.publish(DomainEvent::SourceRemoved { url: stored });
        Ok(())
    }

    /// Move a plugin in the global priority list.
    pub async fn reorder_plugin(&self, from: usize, to: usize) -> Result<Vec<String>> {
        let len = self.manager.plugins().len();
        if from >= len || to >= len {
            return Err(Error::validation(format!(
                "Plugin index out of range: {} -> {} (len {})",
                from, to, len
            )));
        }
        self.persistence.reorder_plugin(from, to).await?;
        self.manager.reorder_plugin(from, to)?;

        let order: Vec<String> = self
            .manager
            .plugins()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        self.events.publish(DomainEvent::PluginReordered {
            order: order.clone(),
        });
        Ok(order)
    }

    /// Enable or disable a plugin and re-home the URLs it gains or loses.
    pub async fn enable_plugin(&self, id: i64, enabled: bool) -> Result<PluginView> {
        let plugin = self
            .manager
            .plugin_by_id(id)
            .ok_or_else(|| Error::not_found("Plugin", id.to_string()))?;

        self.persistence.enable_plugin(id, enabled).await?;
        let changed = self.manager.enable_plugin(id, enabled).await?;
        if changed {
            let mut dispatcher = self.dispatcher.lock();
            let moved = if enabled {
                dispatcher.redistribute_to_enabled_plugin(plugin.name())?
            } else {
                dispatcher.redistribute_from_disabled_plugin(plugin.name())?
            };
            debug!(plugin = %plugin.name(), moved, "Sources re-homed");
        }

        self.events.publish(DomainEvent::PluginEnabled {
            id,
            name: plugin.name().to_string(),
            enabled,
        });
        Ok(PluginView::from(plugin.as_ref()))
    }

    /// Move a plugin within one source's priority list.
    pub async fn reorder_source_plugin(&self, url: &str, from: usize, to: usize) -> Result<SourceView> {
        let (stored, len) = {
            let dispatcher = self.dispatcher.lock();
            let source = dispatcher
                .source(url)
                .ok_or_else(|| Error::not_found("Source", url))?;
            (source.url.clone(), source.plugins.len())
        };
        if from >= len || to >= len {
            return Err(Error::validation(format!(
                "Source plugin index out of range: {} -> {} (len {})",
                from, to, len
            )));
        }

        self.persistence.reorder_source_plugin(&stored, from, to).await?;
        let view = {
            let mut dispatcher = self.dispatcher.lock();
            dispatcher.reorder_source_plugin(&stored, from, to)?;
            self.view_of(&dispatcher, &stored)
        }
        .ok_or_else(|| Error::not_found("Source", url))?;

        self.events.publish(DomainEvent::SourcePluginReordered {
            url: stored,
            plugins: view.plugins.clone(),
        });
        Ok(view)
    }

    /// Start capturing a watched source by hand.
    ///
    /// `address` defaults to the URL itself. Returns false if it is already
    /// being captured.
    pub async fn start_recording(&self, url: &str, address: Option<&str>) -> Result<bool> {
        let label = {
            let mut dispatcher = self.dispatcher.lock();
            let label = dispatcher
                .source(url)
                .map(|s| s.url.clone())
                .ok_or_else(|| Error::not_found("Source", url))?;
            dispatcher.remove(&label);
            label
        };

        let address = address.unwrap_or(label.as_str()).to_string();
        match self.begin_capture(&label, &address).await {
            Ok(started) => Ok(started),
            Err(e) => {
                self.return_to_dispatch(&label);
                Err(e)
            }
        }
    }

    /// Stop a capture. The URL returns to polling once the process exits.
    pub fn stop_recording(&self, url: &str) -> bool {
        let label = self
            .dispatcher
            .lock()
            .source(url)
            .map(|s| s.url.clone())
            .unwrap_or_else(|| url.to_string());
        self.recorder.stop_recording(&label)
    }

    /// Forget an archive record. The file itself is left in place.
    pub async fn remove_archive_record(&self, id: i64) -> Result<()> {
        self.persistence.remove_archive_record(id).await?;
        self.archives.lock().shift_remove(&id);
        self.events.publish(DomainEvent::ArchiveRecordRemoved { id });
        Ok(())
    }

    // ----- queries -----

    /// Files in the archive directory no archive record refers to.
    pub async fn dangling_archives(&self) -> Result<Vec<PathBuf>> {
        let files = fs::list_files(&self.recorder.config().archive_dir).await?;
        let known: HashSet<PathBuf> = self
            .archives
            .lock()
            .values()
            .map(|r| PathBuf::from(&r.path))
            .collect();
        Ok(files.into_iter().filter(|f| !known.contains(f)).collect())
    }

    pub fn archives(&self) -> Vec<ArchiveRecord> {
        self.archives.lock().values().cloned().collect()
    }

    pub fn source(&self, url: &str) -> Option<SourceView> {
        let dispatcher = self.dispatcher.lock();
        self.view_of(&dispatcher, url)
    }

    fn view_of(&self, dispatcher: &StreamDispatcher, url: &str) -> Option<SourceView> {
        let source = dispatcher.source(url)?;
        Some(SourceView::new(
            source,
            dispatcher.owner_of(url),
            self.recorder.is_recording(&source.url),
        ))
    }

    fn quota_views(&self) -> Vec<QuotaView> {
        let mut views = Vec::new();
        if let Some(q) = &self.arbiters.instance {
            views.push(QuotaView {
                name: "instance".into(),
                usage: q.usage(),
                quota: q.quota(),
                decision: q.decision(),
            });
        }
        if let Some(q) = &self.arbiters.storage {
            views.push(QuotaView {
                name: "storage".into(),
                usage: q.usage(),
                quota: q.quota(),
                decision: q.decision(),
            });
        }
        if let Some(q) = &self.arbiters.download_speed {
            views.push(QuotaView {
                name: "download_speed".into(),
                usage: q.usage(),
                quota: q.quota(),
                decision: q.decision(),
            });
        }
        views
    }

    /// Everything an observer needs to catch up.
    pub fn snapshot(&self) -> WardenSnapshot {
        let sources = {
            let dispatcher = self.dispatcher.lock();
            dispatcher
                .sources()
                .filter_map(|s| self.view_of(&dispatcher, &s.url))
                .collect()
        };
        WardenSnapshot {
            sources,
            plugins: self
                .manager
                .plugins()
                .iter()
                .map(|p| PluginView::from(p.as_ref()))
                .collect(),
            jobs: self.recorder.jobs(),
            archives: self.archives(),
            paused: self.manager.is_paused(),
            quotas: self.quota_views(),
            storage: self.monitor.snapshot(),
        }
    }
}
