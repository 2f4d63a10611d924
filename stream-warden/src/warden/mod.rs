//! Application service.
//!
//! The [`Warden`] wires the plugin manager, dispatcher, recorder, arbiters,
//! persistence and notifications together and is the only place that
//! mutates them in response to operator commands.

mod service;
mod snapshot;

pub use service::{QuotaLimits, Warden, WardenParts, output_file_name};
pub use snapshot::{PluginView, QuotaView, RestoreSummary, SourceView, WardenSnapshot};
