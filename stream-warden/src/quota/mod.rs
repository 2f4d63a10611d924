//! Resource arbitration.
//!
//! Each [`Arbiter`] watches one resource dimension, enforces its limit by
//! stopping captures, and casts an admission vote. The
//! [`PluginManagerController`] folds the votes and pauses polling while any
//! arbiter refuses.

mod arbiter;
mod controller;
mod download_speed;
mod instance;
mod monitor;
mod storage;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use arbiter::{Arbiter, CaptureControl};
pub use controller::PluginManagerController;
pub use download_speed::{DownloadSpeedQuota, select_victim};
pub use instance::InstanceQuota;
pub use monitor::{DiskUsageMonitor, StorageSnapshot};
pub use storage::StorageQuota;

/// Feed every message of `rx` to `handle` until `cancel` fires or the
/// channel closes.
fn follow<A, T, F>(arbiter: Arc<A>, cancel: CancellationToken, mut rx: broadcast::Receiver<T>, handle: F)
where
    A: Send + Sync + 'static,
    T: Clone + Send + 'static,
    F: Fn(&A, T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Ok(message) => handle(&arbiter, message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Arbiter fell behind recording events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
