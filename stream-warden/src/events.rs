//! Outward domain events.
//!
//! Every state change an observer may care about is published on the
//! [`EventSink`]. Delivery is at-most-once with no replay; an observer that
//! connects late asks for a snapshot instead.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::database::ArchiveRecord;
use crate::recorder::CaptureProgress;

/// Events published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    SourceAdded {
        url: String,
        plugins: Vec<String>,
    },
    SourceRemoved {
        url: String,
    },
    PluginReordered {
        /// Plugin names in the new priority order.
        order: Vec<String>,
    },
    PluginEnabled {
        id: i64,
        name: String,
        enabled: bool,
    },
    SourcePluginReordered {
        url: String,
        plugins: Vec<String>,
    },
    RecordingStarted {
        label: String,
        output_path: PathBuf,
    },
    RecordingProgress {
        label: String,
        progress: CaptureProgress,
    },
    RecordingRemoved {
        label: String,
    },
    ArchiveRecordAdded {
        record: ArchiveRecord,
    },
    ArchiveRecordRemoved {
        id: i64,
    },
    LastSeenUpdated {
        url: String,
        at: DateTime<Utc>,
    },
    QuotaChanged {
        arbiter: String,
        usage: u64,
        quota: u64,
    },
    PipelinePaused,
    PipelineResumed,
}

impl DomainEvent {
    /// Stable event name, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceAdded { .. } => "source_added",
            Self::SourceRemoved { .. } => "source_removed",
            Self::PluginReordered { .. } => "plugin_reordered",
            Self::PluginEnabled { .. } => "plugin_enabled",
            Self::SourcePluginReordered { .. } => "source_plugin_reordered",
            Self::RecordingStarted { .. } => "recording_started",
            Self::RecordingProgress { .. } => "recording_progress",
            Self::RecordingRemoved { .. } => "recording_removed",
            Self::ArchiveRecordAdded { .. } => "archive_record_added",
            Self::ArchiveRecordRemoved { .. } => "archive_record_removed",
            Self::LastSeenUpdated { .. } => "last_seen_updated",
            Self::QuotaChanged { .. } => "quota_changed",
            Self::PipelinePaused => "pipeline_paused",
            Self::PipelineResumed => "pipeline_resumed",
        }
    }
}

/// Broadcaster for domain events.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventSink {
    /// Create a new sink with default capacity (256).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of observers that received it.
    pub fn publish(&self, event: DomainEvent) -> usize {
        trace!(event = event.name(), "Publishing domain event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
