//! The `resolver` module performs the discovery call that tells the stream
//! manager where the broker currently lives.
//!
//! SondeHub hands out short-lived presigned WebSocket URLs, so the address
//! is fetched again before every connect. A resolver never retries on its
//! own; the manager's reconnect cycle does.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::utils::error::{Result, StreamError};

/// Discovery endpoint returning the broker WebSocket URL as plain text.
pub const DEFAULT_DISCOVERY_URL: &str = "https://api.v2.sondehub.org/sondes/websocket";

/// Produces the broker connection URL.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

/// Resolver doing one HTTP GET against a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpResolver {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamError::resolution(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Resolve for HttpResolver {
    async fn resolve(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::resolution(format!(
                "discovery endpoint {} answered {status}",
                self.url
            )));
        }

        let body = response.text().await?;
        let endpoint = parse_endpoint(&body)?;
        debug!(url = %self.url, "resolved broker endpoint");
        Ok(endpoint)
    }
}

/// Turns a discovery response body into a broker address.
///
/// The body is the address; only surrounding whitespace is dropped. An empty
/// body is an error rather than an empty address.
pub fn parse_endpoint(body: &str) -> Result<String> {
    let endpoint = body.trim();
    if endpoint.is_empty() {
        return Err(StreamError::resolution(
            "discovery endpoint returned an empty body",
        ));
    }
    Ok(endpoint.to_string())
}
