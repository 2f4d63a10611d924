//! Disk usage monitoring for the archive directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::task::{RecurringTask, Task, TaskState};
use crate::utils::fs;
use crate::{Error, Result};

/// One measurement of the archive directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Bytes held by files below the archive directory.
    pub used_bytes: u64,
    /// Free space on the disk holding the archive, when it can be determined.
    pub available_bytes: Option<u64>,
}

/// Free space on the disk whose mount point best matches `path`.
fn available_space_for(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let path_str = path.to_string_lossy();
    let mut best_match: Option<(&sysinfo::Disk, usize)> = None;

    for disk in disks.list() {
        let mount_point = disk.mount_point().to_string_lossy();
        if path_str.starts_with(mount_point.as_ref()) {
            let mount_len = mount_point.len();
            // Keep the most specific mount point.
            if best_match.is_none_or(|(_, len)| mount_len > len) {
                best_match = Some((disk, mount_len));
            }
        }
    }

    best_match.map(|(disk, _)| disk.available_space())
}

struct DiskProbe {
    archive_dir: PathBuf,
    snapshot_tx: watch::Sender<StorageSnapshot>,
}

#[async_trait]
impl Task for DiskProbe {
    async fn run(&self, _stop: &CancellationToken) -> Result<()> {
        let used_bytes = match fs::dir_size(&self.archive_dir).await {
            Ok(size) => size,
            Err(e) => {
                warn!(dir = %self.archive_dir.display(), error = %e, "Failed to measure archive directory");
                return Ok(());
            }
        };

        let absolute = std::path::absolute(&self.archive_dir).unwrap_or_else(|_| self.archive_dir.clone());
        let available_bytes = tokio::task::spawn_blocking(move || available_space_for(&absolute))
            .await
            .unwrap_or(None);

        let snapshot = StorageSnapshot {
            used_bytes,
            available_bytes,
        };
        debug!(used_bytes, available_bytes = ?available_bytes, "Archive directory measured");
        self.snapshot_tx.send_replace(snapshot);
        Ok(())
    }

    fn on_abort(&self, error: &Error) {
        error!(error = %error, "Disk usage monitor aborted");
    }
}

/// Periodically measures the archive directory.
pub struct DiskUsageMonitor {
    runner: RecurringTask<DiskProbe>,
}

impl DiskUsageMonitor {
    pub fn new(archive_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        let (snapshot_tx, _) = watch::channel(StorageSnapshot::default());
        let probe = DiskProbe {
            archive_dir: archive_dir.into(),
            snapshot_tx,
        };
        Self {
            runner: RecurringTask::new(Arc::new(probe), interval),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StorageSnapshot> {
        self.runner.task().snapshot_tx.subscribe()
    }

    /// Latest measurement.
    pub fn snapshot(&self) -> StorageSnapshot {
        *self.runner.task().snapshot_tx.borrow()
    }

    pub fn start(&self) {
        self.runner.start();
    }

    pub async fn stop(&self) {
        self.runner.stop().await;
    }

    pub fn state(&self) -> TaskState {
        self.runner.state()
    }

    /// Measure once outside the timer.
    pub async fn measure_now(&self) -> Result<StorageSnapshot> {
        self.runner.task().run(&CancellationToken::new()).await?;
        Ok(self.snapshot())
    }
}
