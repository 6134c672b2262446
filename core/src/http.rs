//! HTTP client boundary.
//!
//! The engine hands a fully resolved [`HttpRequest`] to an [`HttpClient`] and
//! gets back either a response (whatever its status) or an [`HttpError`]
//! telling it whether the request ever left the process. Status policy is
//! applied by the engine, not the client.

use crate::request::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A fully resolved outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL with route parameters substituted
    pub url: String,
    /// Headers to send
    pub headers: BTreeMap<String, String>,
    /// Query parameters to append
    #[serde(rename = "params")]
    pub query: BTreeMap<String, String>,
    /// JSON body, if any
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A response from a downstream service, whatever its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status
    pub status: u16,
    /// Response headers, lowercase names
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the raw text when it is not JSON
    pub body: Value,
}

/// A call that produced no response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request was sent but nothing came back (refused, reset, timeout)
    #[error("{message}")]
    NoResponse {
        /// Transport error message
        message: String,
    },

    /// The request could not be built or sent
    #[error("{message}")]
    Setup {
        /// Setup error message
        message: String,
    },
}

impl HttpError {
    /// The underlying message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::NoResponse { message } | Self::Setup { message } => message,
        }
    }
}

/// Sends resolved calls to downstream services.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the engine can hold an
/// `Arc<dyn HttpClient>`. Timeouts are the implementation's concern.
pub trait HttpClient: Send + Sync {
    /// Send one request.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] when no response was received. A response with
    /// any status, including 4xx and 5xx, is `Ok`.
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + '_>>;
}
