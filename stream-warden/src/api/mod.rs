//! JSON command surface.
//!
//! Commands are looked up by name in a table built once at construction;
//! each takes a JSON argument object and answers with a JSON value.

mod commands;

pub use commands::{CommandTable, Handler};
