//! HTTP client abstraction for the remote generation endpoint.
//!
//! This module provides a trait-based abstraction over HTTP clients, enabling
//! dependency injection and easy mocking in tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::BackendError;

/// Status and raw body of an HTTP response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code
    pub status: u16,
    /// Undecoded response body
    pub body: Vec<u8>,
}

impl HttpReply {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for HTTP communication with the generation endpoint.
///
/// This abstraction allows injecting mock HTTP clients for testing without
/// making real network requests.
///
/// # Example
///
/// ```ignore
/// use ascii_dream::http_client::{HttpClient, ReqwestHttpClient};
///
/// let client = ReqwestHttpClient::new(std::time::Duration::from_secs(60));
/// let reply = client.post_json(
///     "https://example.com/generate",
///     &[("Content-Type", "application/json")],
///     &serde_json::json!({"prompt": "cosmic dust"}),
/// ).await?;
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body and returns the raw reply.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Timeout`] when the request exceeds the client
    /// timeout and [`BackendError::Network`] for any other transport failure.
    /// Non-2xx statuses are not errors at this layer.
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<HttpReply, BackendError>;
}

/// HTTP client implementation using reqwest.
pub struct ReqwestHttpClient {
    client: Client,
    timeout: Duration,
}

impl ReqwestHttpClient {
    /// Creates a client whose requests give up after `timeout`.
    ///
    /// Generation endpoints can spend close to a minute on a cold start, so
    /// callers should be generous.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    fn classify(&self, err: &reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<HttpReply, BackendError> {
        let mut request = self.client.post(url).timeout(self.timeout);

        for (key, value) in headers {
            request = request.header(*key, *value);
        }

        let response = request.json(body).send().await.map_err(|e| self.classify(&e))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| self.classify(&e))?;
        debug!(url, status, bytes = bytes.len(), "generation endpoint replied");

        Ok(HttpReply {
            status,
            body: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_success_range() {
        let ok = HttpReply {
            status: 200,
            body: vec![],
        };
        let created = HttpReply {
            status: 204,
            body: vec![],
        };
        let bad = HttpReply {
            status: 502,
            body: b"bad gateway".to_vec(),
        };
        assert!(ok.is_success());
        assert!(created.is_success());
        assert!(!bad.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let client = ReqwestHttpClient::new(Duration::from_secs(2));
        // Port 9 on localhost (discard) is closed on any sane test machine.
        let result = client
            .post_json("http://127.0.0.1:9/generate", &[], &serde_json::json!({}))
            .await;
        match result {
            Err(err) => assert!(err.is_transient(), "{err}"),
            Ok(reply) => panic!("expected connection failure, got status {}", reply.status),
        }
    }
}
