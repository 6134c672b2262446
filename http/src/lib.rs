//! # Mediator HTTP
//!
//! [`ReqwestHttpClient`] implements the engine's [`HttpClient`] boundary on
//! top of `reqwest`.
//!
//! - Every status is returned as a response; status policy belongs to the engine
//! - Bodies are streamed with a size cap and parsed as JSON when possible
//! - Transport failures map to [`HttpError::NoResponse`], requests that could
//!   not be built to [`HttpError::Setup`]
//!
//! # Example
//!
//! ```no_run
//! use mediator_http::ReqwestHttpClient;
//! use std::time::Duration;
//!
//! let client = ReqwestHttpClient::builder()
//!     .timeout(Duration::from_secs(10))
//!     .user_agent("lookup-mediator/0.1")
//!     .build()?;
//! # Ok::<(), mediator_core::http::HttpError>(())
//! ```

use futures::StreamExt;
use mediator_core::http::{HttpClient, HttpError, HttpRequest, HttpResponse};
use mediator_core::request::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default maximum response size (50MB)
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 50 * 1024 * 1024;

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`ReqwestHttpClient`].
#[derive(Debug, Clone)]
pub struct ReqwestHttpClientBuilder {
    timeout: Duration,
    max_response_bytes: usize,
    user_agent: Option<String>,
}

impl Default for ReqwestHttpClientBuilder {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: None,
        }
    }
}

impl ReqwestHttpClientBuilder {
    /// Per-call timeout, covering connect through the last body byte.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Largest response body accepted.
    #[must_use]
    pub const fn max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    /// `User-Agent` sent with every call.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Setup`] if the TLS backend cannot be initialized.
    pub fn build(self) -> Result<ReqwestHttpClient, HttpError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let client = builder.build().map_err(|e| HttpError::Setup {
            message: format!("Failed to build HTTP client: {e}"),
        })?;

        Ok(ReqwestHttpClient {
            client,
            max_response_bytes: self.max_response_bytes,
        })
    }
}

/// `reqwest`-backed [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl ReqwestHttpClient {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> ReqwestHttpClientBuilder {
        ReqwestHttpClientBuilder::default()
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        // Stream response with size limit
        let mut body_bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HttpError::NoResponse {
                message: format!("Failed to read response: {e}"),
            })?;
            if body_bytes.len() + chunk.len() > self.max_response_bytes {
                return Err(HttpError::NoResponse {
                    message: format!("Response too large (>{} bytes)", self.max_response_bytes),
                });
            }
            body_bytes.extend_from_slice(&chunk);
        }

        let body = serde_json::from_slice(&body_bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body_bytes).into_owned()));

        tracing::debug!(url = %request.url, status, "downstream call completed");
        Ok(HttpResponse { status, headers, body })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}

const fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

/// A request that never left the process is a setup failure; anything that
/// failed after that is "no response".
fn classify(error: &reqwest::Error) -> HttpError {
    if error.is_builder() {
        HttpError::Setup {
            message: error.to_string(),
        }
    } else {
        HttpError::NoResponse {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = ReqwestHttpClient::builder();
        assert_eq!(builder.timeout, DEFAULT_TIMEOUT);
        assert_eq!(builder.max_response_bytes, DEFAULT_MAX_RESPONSE_BYTES);
        assert!(builder.user_agent.is_none());
    }

    #[test]
    fn methods_map_one_to_one() {
        assert_eq!(reqwest_method(Method::Patch), reqwest::Method::PATCH);
        assert_eq!(reqwest_method(Method::Options), reqwest::Method::OPTIONS);
    }
}
