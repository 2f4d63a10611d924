//! Source registry and URL ownership.
//!
//! Every watched URL is held by exactly one owner at a time: its active
//! plugin, the unassigned sentinel, or (while it is being recorded) nobody.

mod source;
mod table;

pub use source::{WatchedSource, source_key};
pub use table::{Owner, StreamDispatcher};
