//! Command table.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::warden::Warden;
use crate::{Error, Result};

/// A command implementation.
pub type Handler = fn(Arc<Warden>, Value) -> BoxFuture<'static, Result<Value>>;

#[derive(Debug, Deserialize)]
struct UrlArgs {
    url: String,
}

#[derive(Debug, Deserialize)]
struct MoveArgs {
    from: usize,
    to: usize,
}

#[derive(Debug, Deserialize)]
struct SourceMoveArgs {
    url: String,
    from: usize,
    to: usize,
}

#[derive(Debug, Deserialize)]
struct EnableArgs {
    id: i64,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct StartArgs {
    url: String,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdArgs {
    id: i64,
}

fn args<T: DeserializeOwned>(command: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("Invalid arguments for '{}': {}", command, e)))
}

fn add_source(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: UrlArgs = args("add_source", value)?;
        let view = warden.add_source(&a.url).await?;
        Ok(serde_json::to_value(view)?)
    })
}

fn remove_source(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: UrlArgs = args("remove_source", value)?;
        warden.remove_source(&a.url).await?;
        Ok(json!({ "removed": a.url }))
    })
}

fn reorder_plugin(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: MoveArgs = args("reorder_plugin", value)?;
        let order = warden.reorder_plugin(a.from, a.to).await?;
        Ok(json!({ "order": order }))
    })
}

fn enable_plugin(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: EnableArgs = args("enable_plugin", value)?;
        let plugin = warden.enable_plugin(a.id, a.enabled).await?;
        Ok(serde_json::to_value(plugin)?)
    })
}

fn reorder_source_plugin(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: SourceMoveArgs = args("reorder_source_plugin", value)?;
        let view = warden.reorder_source_plugin(&a.url, a.from, a.to).await?;
        Ok(serde_json::to_value(view)?)
    })
}

fn start_recording(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: StartArgs = args("start_recording", value)?;
        let started = warden.start_recording(&a.url, a.address.as_deref()).await?;
        Ok(json!({ "started": started }))
    })
}

fn stop_recording(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: UrlArgs = args("stop_recording", value)?;
        Ok(json!({ "stopped": warden.stop_recording(&a.url) }))
    })
}

fn remove_archive_record(warden: Arc<Warden>, value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let a: IdArgs = args("remove_archive_record", value)?;
        warden.remove_archive_record(a.id).await?;
        Ok(json!({ "removed": a.id }))
    })
}

fn dangling_archives(warden: Arc<Warden>, _value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let files = warden.dangling_archives().await?;
        Ok(serde_json::to_value(files)?)
    })
}

fn snapshot(warden: Arc<Warden>, _value: Value) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move { Ok(serde_json::to_value(warden.snapshot())?) })
}

/// Name to handler map over one warden.
pub struct CommandTable {
    warden: Arc<Warden>,
    handlers: HashMap<&'static str, Handler>,
}

impl CommandTable {
    pub fn new(warden: Arc<Warden>) -> Self {
        let entries: [(&'static str, Handler); 10] = [
            ("add_source", add_source),
            ("remove_source", remove_source),
            ("reorder_plugin", reorder_plugin),
            ("enable_plugin", enable_plugin),
            ("reorder_source_plugin", reorder_source_plugin),
            ("start_recording", start_recording),
            ("stop_recording", stop_recording),
            ("remove_archive_record", remove_archive_record),
            ("dangling_archives", dangling_archives),
            ("snapshot", snapshot),
        ];
        Self {
            warden,
            handlers: entries.into_iter().collect(),
        }
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run a command. `Value::Null` counts as an empty argument object.
    pub async fn execute(&self, command: &str, value: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(command)
            .ok_or_else(|| Error::not_found("Command", command))?;
        let value = if value.is_null() { json!({}) } else { value };
        debug!(command = %command, "Executing command");
        handler(self.warden.clone(), value).await
    }
}
