//! Best-effort operator notifications.
//!
//! Delivery is fire-and-forget: callers never wait on the network and a
//! failed delivery is only logged.

mod webhook;

pub use webhook::{WebhookConfig, WebhookNotifier};

use serde_json::Value;

/// Outbound notification channel.
pub trait Notifier: Send + Sync {
    /// Deliver to every subscriber.
    fn notify_all(&self, payload: Value);

    /// Deliver to subscribers of one category (e.g. `"live"`).
    fn notify_by_category(&self, payload: Value, category: &str);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_all(&self, _payload: Value) {}

    fn notify_by_category(&self, _payload: Value, _category: &str) {}
}
