//! Generic webhook notifier.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::Notifier;
use crate::{Error, Result};

/// Webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Target URL.
    pub url: String,
    /// Optional bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Extra headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            headers: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Posts each notification as JSON to a single URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        crate::utils::http_client::install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                headers.insert(name, value);
            }
        }

        if let Some(token) = &self.config.token
            && let Ok(value) = format!("Bearer {}", token).parse()
        {
            headers.insert(AUTHORIZATION, value);
        }

        headers
    }

    /// Wrap a payload with its category and a timestamp.
    pub fn build_body(payload: Value, category: Option<&str>) -> Value {
        json!({
            "category": category,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": payload,
        })
    }

    /// Deliver one body and wait for the response.
    pub async fn send(&self, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("Webhook failed: {} - {}", status, text)));
        }

        debug!(url = %self.config.url, "Webhook notification sent");
        Ok(())
    }

    fn dispatch(&self, body: Value) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available; dropping webhook notification");
            return;
        };
        let notifier = self.clone();
        runtime.spawn(async move {
            if let Err(e) = notifier.send(&body).await {
                warn!(url = %notifier.config.url, error = %e, "Webhook notification failed");
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn notify_all(&self, payload: Value) {
        self.dispatch(Self::build_body(payload, None));
    }

    fn notify_by_category(&self, payload: Value, category: &str) {
        self.dispatch(Self::build_body(payload, Some(category)));
    }
}
