//! HTTP transport used for manifest fetches and package downloads.

use std::collections::HashMap;
use std::time::Duration;

use super::{UpdaterError, UpdaterResult};

/// A fully buffered HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: HashMap<String, String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Build a response with the given status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: HashMap::new(), body: body.into() }
    }

    /// Add a header (name is lowercased).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Blocking GET transport.
///
/// Implementations must honour `timeout` and report transport failures
/// (including timeouts) as [`UpdaterError::Network`]. Non-200 statuses are
/// returned as responses, not errors.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> UpdaterResult<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest::blocking`.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Create a client sending the given user agent.
    pub fn new(user_agent: &str) -> UpdaterResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| UpdaterError::Network(e.to_string()))?;

        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, timeout: Duration) -> UpdaterResult<HttpResponse> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| UpdaterError::Network(format!("{url}: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.bytes().map_err(|e| UpdaterError::Network(format!("{url}: {e}")))?;

        Ok(HttpResponse { status, headers, body: body.to_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(429, "").with_header("X-MRS-Block-Reason", "Token limit");
        assert_eq!(response.header("x-mrs-block-reason"), Some("Token limit"));
        assert_eq!(response.header("X-Mrs-Block-Reason"), Some("Token limit"));
        assert_eq!(response.header("missing"), None);
    }
}
