//! Capture supervisor.
//!
//! The [`RecordingService`] runs one capture process per label. Each job gets
//! a supervisor task that waits for the process (or a stop request), and a
//! reader task that turns stderr progress lines into throttled
//! [`RecordingEvent::Progress`] updates. When the process exits the output is
//! moved into the archive directory and [`RecordingEvent::Completed`] fires.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::CaptureBackend;
use super::progress::{CaptureProgress, parse_progress};
use super::records::RecordReader;
use super::throttle::Throttle;
use crate::utils::fs;
use crate::{Error, Result};

/// Capacity of the recording event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Recording service settings.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Where finished captures are moved.
    pub archive_dir: PathBuf,
    /// How long a process gets to exit after `q` before it is killed.
    pub quit_timeout: Duration,
    /// Progress coalescing window.
    pub progress_window: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./archive"),
            quit_timeout: Duration::from_secs(10),
            progress_window: Duration::from_secs(1),
        }
    }
}

/// A running capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureJob {
    pub id: Uuid,
    /// Job key; the watched URL.
    pub label: String,
    /// Capture address the process reads from.
    pub source: String,
    pub output_path: PathBuf,
    pub progress: CaptureProgress,
    pub started_at: DateTime<Utc>,
}

/// Events emitted by the recording service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordingEvent {
    Started {
        label: String,
        output_path: PathBuf,
    },
    Progress {
        label: String,
        progress: CaptureProgress,
    },
    /// The job was withdrawn by a stop request. `Completed` still follows
    /// once the process exits.
    Stopped { label: String },
    Completed {
        label: String,
        /// Final location of the capture.
        path: PathBuf,
        /// Whether the file made it into the archive directory.
        archived: bool,
        size_bytes: u64,
        duration_secs: f64,
        exit_code: Option<i32>,
    },
}

impl RecordingEvent {
    pub fn label(&self) -> &str {
        match self {
            Self::Started { label, .. }
            | Self::Progress { label, .. }
            | Self::Stopped { label }
            | Self::Completed { label, .. } => label,
        }
    }
}

struct JobEntry {
    job: CaptureJob,
    stop: CancellationToken,
}

struct Inner {
    backend: Arc<dyn CaptureBackend>,
    config: RecorderConfig,
    /// Active jobs in start order.
    jobs: Mutex<IndexMap<String, JobEntry>>,
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl Inner {
    fn emit(&self, event: RecordingEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Store a progress sample on the job, if it is still the same job.
    fn record_progress(&self, label: &str, id: Uuid, progress: &CaptureProgress) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(label) {
            Some(entry) if entry.job.id == id => {
                entry.job.progress = progress.clone();
                true
            }
            _ => false,
        }
    }

    fn remove_if_same(&self, label: &str, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.get(label).is_some_and(|e| e.job.id == id) {
            jobs.shift_remove(label);
            true
        } else {
            false
        }
    }
}

/// Supervises capture processes, one per label.
#[derive(Clone)]
pub struct RecordingService {
    inner: Arc<Inner>,
}

impl RecordingService {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: RecorderConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                jobs: Mutex::new(IndexMap::new()),
                event_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.inner.config
    }

    /// Start capturing `source` into `output_path` under `label`.
    ///
    /// Returns `Ok(false)` without doing anything when a job already exists
    /// for the label.
    pub async fn start_recording(
        &self,
        label: &str,
        source: &str,
        output_path: impl Into<PathBuf>,
    ) -> Result<bool> {
        let output_path = output_path.into();
        if self.is_recording(label) {
            debug!(label = %label, "Already recording");
            return Ok(false);
        }
        fs::ensure_parent_dir(&output_path).await?;

        let id = Uuid::new_v4();
        let (mut child, stop) = {
            let mut jobs = self.inner.jobs.lock();
            if jobs.contains_key(label) {
                return Ok(false);
            }

            let mut cmd = self.inner.backend.command(source, &output_path);
            let child = cmd.spawn().map_err(|e| {
                Error::Process(format!(
                    "Failed to spawn {}: {}",
                    self.inner.backend.name(),
                    e
                ))
            })?;

            let stop = CancellationToken::new();
            jobs.insert(
                label.to_string(),
                JobEntry {
                    job: CaptureJob {
                        id,
                        label: label.to_string(),
                        source: source.to_string(),
                        output_path: output_path.clone(),
                        progress: CaptureProgress::default(),
                        started_at: Utc::now(),
                    },
                    stop: stop.clone(),
                },
            );
            (child, stop)
        };

        info!(
            label = %label,
            backend = %self.inner.backend.name(),
            output = %output_path.display(),
            "Recording started"
        );
        self.inner.emit(RecordingEvent::Started {
            label: label.to_string(),
            output_path: output_path.clone(),
        });

        let reader = child.stderr.take().map(|stderr| {
            tokio::spawn(read_progress(
                self.inner.clone(),
                label.to_string(),
                id,
                stderr,
            ))
        });
        tokio::spawn(supervise(
            self.inner.clone(),
            label.to_string(),
            id,
            child,
            stop,
            reader,
            output_path,
        ));

        Ok(true)
    }

    /// Ask the capture for `label` to finish.
    ///
    /// The job is withdrawn immediately; the process gets `q` on stdin and is
    /// killed if it has not exited within the quit timeout. Returns false if
    /// there was no job.
    pub fn stop_recording(&self, label: &str) -> bool {
        let Some(entry) = self.inner.jobs.lock().shift_remove(label) else {
            return false;
        };
        entry.stop.cancel();
        info!(label = %label, "Recording stop requested");
        self.inner.emit(RecordingEvent::Stopped {
            label: label.to_string(),
        });
        true
    }

    /// Stop every active job.
    pub fn stop_all(&self) -> usize {
        self.active_labels()
            .iter()
            .filter(|label| self.stop_recording(label))
            .count()
    }

    pub fn is_recording(&self, label: &str) -> bool {
        self.inner.jobs.lock().contains_key(label)
    }

    /// Active labels, oldest first.
    pub fn active_labels(&self) -> Vec<String> {
        self.inner.jobs.lock().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn job(&self, label: &str) -> Option<CaptureJob> {
        self.inner.jobs.lock().get(label).map(|e| e.job.clone())
    }

    /// Snapshot of the active jobs, oldest first.
    pub fn jobs(&self) -> Vec<CaptureJob> {
        self.inner
            .jobs
            .lock()
            .values()
            .map(|e| e.job.clone())
            .collect()
    }

    /// Latest reported bitrate of a job in bytes per second.
    pub fn bitrate_of(&self, label: &str) -> Option<u64> {
        self.inner
            .jobs
            .lock()
            .get(label)
            .map(|e| e.job.progress.bitrate)
    }
}

impl std::fmt::Debug for RecordingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingService")
            .field("backend", &self.inner.backend.name())
            .field("active", &self.active_labels())
            .finish()
    }
}

/// What the reader saw by the time stderr closed.
#[derive(Debug, Default)]
struct ReaderSummary {
    size_bytes: u64,
    duration_secs: f64,
}

async fn read_progress(
    inner: Arc<Inner>,
    label: String,
    id: Uuid,
    stderr: ChildStderr,
) -> ReaderSummary {
    let mut records = RecordReader::new(stderr);
    let mut throttle = Throttle::new(inner.config.progress_window);
    let mut summary = ReaderSummary::default();
    let mut last_emitted: Option<String> = None;

    let mut publish = |mut sample: CaptureProgress| {
        sample.paused = last_emitted.as_deref() == Some(sample.elapsed.as_str());
        last_emitted = Some(sample.elapsed.clone());
        if inner.record_progress(&label, id, &sample) {
            inner.emit(RecordingEvent::Progress {
                label: label.clone(),
                progress: sample,
            });
        }
    };

    loop {
        let deadline = throttle.deadline();
        tokio::select! {
            record = records.next_record() => match record {
                Ok(Some(line)) => {
                    if let Some(sample) = parse_progress(&line) {
                        summary.size_bytes = sample.size_bytes;
                        summary.duration_secs = sample.elapsed_secs;
                        throttle.offer(sample, Instant::now());
                    } else if line.contains("Error") || line.contains("error") {
                        warn!(label = %label, line = %line, "Capture process reported an error");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(label = %label, error = %e, "Error reading capture output");
                    break;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(sample) = throttle.take_due(Instant::now()) {
                    publish(sample);
                }
            }
        }
    }

    // The final sample is released even if its window is still open.
    if let Some(sample) = throttle.flush() {
        publish(sample);
    }

    summary
}

async fn supervise(
    inner: Arc<Inner>,
    label: String,
    id: Uuid,
    mut child: Child,
    stop: CancellationToken,
    reader: Option<tokio::task::JoinHandle<ReaderSummary>>,
    output_path: PathBuf,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop.cancelled() => None,
    };

    let exit_code = match waited {
        Some(Ok(status)) => {
            if !status.success() {
                warn!(label = %label, status = %status, "Capture process exited with failure");
            }
            status.code()
        }
        Some(Err(e)) => {
            error!(label = %label, error = %e, "Error waiting for capture process");
            None
        }
        None => quit(&label, &mut child, inner.config.quit_timeout).await,
    };

    let summary = match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => ReaderSummary::default(),
    };

    let (path, archived) = relocate(&label, &output_path, &inner.config.archive_dir).await;
    let size_bytes = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len())
        .unwrap_or(summary.size_bytes);

    inner.remove_if_same(&label, id);
    info!(
        label = %label,
        path = %path.display(),
        archived,
        size_bytes,
        exit_code = ?exit_code,
        "Recording completed"
    );
    inner.emit(RecordingEvent::Completed {
        label,
        path,
        archived,
        size_bytes,
        duration_secs: summary.duration_secs,
        exit_code,
    });
}

/// Ask the process to quit, killing it if it does not exit in time.
async fn quit(label: &str, child: &mut Child, quit_timeout: Duration) -> Option<i32> {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q").await {
            debug!(label = %label, error = %e, "Could not send quit to capture process");
        }
        let _ = stdin.flush().await;
    }

    match timeout(quit_timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            error!(label = %label, error = %e, "Error waiting for capture process");
            None
        }
        Err(_) => {
            warn!(label = %label, "Capture process did not exit in time; killing");
            let _ = child.kill().await;
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(label = %label, error = %e, "Error waiting for killed capture process");
                    None
                }
            }
        }
    }
}

/// Move a finished capture into the archive directory.
///
/// Failures are logged and the file is left where it is.
async fn relocate(label: &str, output: &Path, archive_dir: &Path) -> (PathBuf, bool) {
    if output.parent() == Some(archive_dir) {
        return (output.to_path_buf(), true);
    }
    match fs::move_into_dir(output, archive_dir).await {
        Ok(path) => (path, true),
        Err(e) => {
            warn!(label = %label, error = %e, "Failed to archive capture");
            (output.to_path_buf(), false)
        }
    }
}
