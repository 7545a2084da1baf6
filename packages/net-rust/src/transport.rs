//! HTTP transport abstraction.
//!
//! The loader talks to the network through [`Transport`] so tests can swap in
//! an in-memory implementation. [`ReqwestTransport`] is the production one.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Url;

use crate::config::NetConfig;

/// A GET request for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl ResourceRequest {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Sets the `Accept` header.
    ///
    /// # Errors
    ///
    /// Returns an error if `accept` is not a valid header value.
    pub fn accept(mut self, accept: &str) -> anyhow::Result<Self> {
        self.headers.insert(ACCEPT, HeaderValue::from_str(accept)?);
        Ok(self)
    }
}

/// Fetches resource bodies.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs the request and returns the full body.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or a non-success status.
    async fn get(&self, request: ResourceRequest) -> anyhow::Result<Bytes>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client with the configured user agent and timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn from_config(config: &NetConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: ResourceRequest) -> anyhow::Result<Bytes> {
        let response = self
            .client
            .get(request.url)
            .headers(request.headers)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_is_set() {
        let url = Url::parse("https://example.com/a.png").unwrap();
        let request = ResourceRequest::new(url).accept("image/*").unwrap();
        assert_eq!(request.headers.get(ACCEPT).unwrap(), "image/*");
    }

    #[test]
    fn invalid_accept_header_is_rejected() {
        let url = Url::parse("https://example.com/a.png").unwrap();
        assert!(ResourceRequest::new(url).accept("bad\nvalue").is_err());
    }

    #[test]
    fn client_builds_from_default_config() {
        assert!(ReqwestTransport::from_config(&NetConfig::default()).is_ok());
    }
}
