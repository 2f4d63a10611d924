//! stream-warden library crate.
//!
//! Watches live-stream sources through plugins, captures them with ffmpeg
//! when they go live, archives the results and arbitrates resource quotas.

pub mod api;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod locator;
pub mod logging;
pub mod notification;
pub mod quota;
pub mod recorder;
pub mod task;
pub mod utils;
pub mod warden;

pub use error::{Error, Result};
