//! Capture recording.
//!
//! - [`RecordingService`]: one supervised capture process per label
//! - [`CaptureBackend`]: builds the capture command ([`FfmpegBackend`])
//! - [`parse_size_str`] / [`parse_progress`]: stderr progress parsing
//! - [`Throttle`]: last-value-wins progress coalescing

mod backend;
mod progress;
mod records;
mod service;
mod throttle;

pub use backend::{CaptureBackend, FfmpegBackend};
pub use progress::{CaptureProgress, parse_progress, parse_size_str, parse_time};
pub use service::{CaptureJob, RecorderConfig, RecordingEvent, RecordingService};
pub use throttle::Throttle;
