//! Source polling.
//!
//! - [`StreamExtractor`]: site adapter capability (URL compatibility and
//!   resolution to a capture address)
//! - [`LocatorService`]: polls the URLs assigned to one plugin
//! - [`PluginManager`]: priority-ordered registry of plugins

mod extractor;
mod manager;
pub(crate) mod service;

pub use extractor::{HlsProbeExtractor, StreamExtractor};
pub use manager::{Plugin, PluginManager};
pub use service::{LiveEvent, LocatorService};
