//! Stream extractor capability.
//!
//! An extractor decides whether it understands a source URL and, when asked,
//! resolves it to a capturable media address if the source is live. Site
//! specific adapters implement [`StreamExtractor`]; the plugin list picks one
//! per locator at registration time.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::{Error, Result};

/// Default HTTP timeout for probe requests.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolves watched URLs to capture addresses.
#[async_trait]
pub trait StreamExtractor: Send + Sync {
    /// Whether this extractor understands the URL.
    fn can_parse(&self, url: &str) -> bool;

    /// Resolve a URL.
    ///
    /// Returns `Ok(Some(address))` when the source is live, `Ok(None)` when it
    /// is reachable but offline, and `Err` for network or parse failures.
    async fn extract(&self, url: &str) -> Result<Option<String>>;
}

/// Generic adapter for directly published HLS playlists.
///
/// A playlist is considered live while it is served and has no
/// `#EXT-X-ENDLIST` tag. The capture address is the playlist URL itself.
pub struct HlsProbeExtractor {
    pattern: Regex,
    client: Client,
}

impl HlsProbeExtractor {
    /// Create an extractor accepting URLs matching `pattern`.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::config(format!("Invalid extractor pattern '{}': {}", pattern, e)))?;
        crate::utils::http_client::install_rustls_provider();
        let client = Client::builder()
            .timeout(DEFAULT_PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { pattern, client })
    }

    /// Create an extractor for any `.m3u8` URL.
    pub fn any_playlist() -> Result<Self> {
        Self::new(r"(?i)^https?://.+\.m3u8(\?.*)?$")
    }

    /// Whether a playlist body describes a stream that is still running.
    pub fn playlist_is_live(body: &str) -> bool {
        body.trim_start().starts_with("#EXTM3U") && !body.contains("#EXT-X-ENDLIST")
    }
}

#[async_trait]
impl StreamExtractor for HlsProbeExtractor {
    fn can_parse(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    async fn extract(&self, url: &str) -> Result<Option<String>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!(url = %url, status = %status, "Playlist not published");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::extractor(format!(
                "Unexpected status {} for {}",
                status, url
            )));
        }

        let body = response.text().await?;
        if Self::playlist_is_live(&body) {
            Ok(Some(url.to_string()))
        } else {
            Ok(None)
        }
    }
}
