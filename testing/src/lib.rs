//! # Mediator Testing
//!
//! Testing utilities for the lookup mediator.
//!
//! This crate provides:
//! - Deterministic clocks
//! - A scripted [`MockHttpClient`] that records calls and tracks how many are in flight
//! - A [`MockPublisher`] that records published messages
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```
//! use mediator_core::http::HttpClient;
//! use mediator_testing::{MockHttpClient, MockReply};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let http = MockHttpClient::new()
//!     .route("http://registry/patients/7", MockReply::json(200, json!({"id": 7})));
//!
//! let response = http
//!     .send(mediator_testing::get("http://registry/patients/7"))
//!     .await
//!     .unwrap();
//! assert_eq!(response.body, json!({"id": 7}));
//! assert_eq!(http.calls_to("http://registry/patients/7"), 1);
//! # });
//! ```

use chrono::{DateTime, Utc};
use mediator_core::environment::Clock;
use mediator_core::http::{HttpClient, HttpError, HttpRequest, HttpResponse};
use mediator_core::publisher::{PublishAck, PublishError, Publisher};
use mediator_core::request::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{AtomicI64, Clock, DateTime, Ordering, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use mediator_testing::mocks::FixedClock;
    /// use mediator_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that advances by a fixed step on every reading.
    ///
    /// Useful for asserting that durations are computed from start and end
    /// readings rather than from the wall clock.
    #[derive(Debug)]
    pub struct SteppingClock {
        start: DateTime<Utc>,
        step_ms: i64,
        readings: AtomicI64,
    }

    impl SteppingClock {
        /// Clock starting at `start`, advancing `step_ms` per reading.
        #[must_use]
        pub const fn new(start: DateTime<Utc>, step_ms: i64) -> Self {
            Self {
                start,
                step_ms,
                readings: AtomicI64::new(0),
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let n = self.readings.fetch_add(1, Ordering::SeqCst);
            self.start + chrono::Duration::milliseconds(n * self.step_ms)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// Never, in practice; the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// What a [`MockHttpClient`] answers with.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: Result<HttpResponse, HttpError>,
    delay: Duration,
}

impl MockReply {
    /// A response with a JSON (or any) body.
    #[must_use]
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            outcome: Ok(HttpResponse {
                status,
                headers: BTreeMap::new(),
                body,
            }),
            delay: Duration::ZERO,
        }
    }

    /// The request was sent but nothing came back.
    #[must_use]
    pub fn no_response(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(HttpError::NoResponse {
                message: message.into(),
            }),
            delay: Duration::ZERO,
        }
    }

    /// The request could not be sent.
    #[must_use]
    pub fn setup_error(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(HttpError::Setup {
                message: message.into(),
            }),
            delay: Duration::ZERO,
        }
    }

    /// Add a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Ok(response) = &mut self.outcome {
            response.headers.insert(name.into(), value.into());
        }
        self
    }

    /// Settle only after `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = Arc<dyn Fn(&HttpRequest) -> Option<MockReply> + Send + Sync>;

/// Scripted [`HttpClient`].
///
/// Routes are matched on the full URL (query excluded); handlers are tried
/// in registration order after routes. Unmatched calls answer 404.
#[derive(Clone, Default)]
pub struct MockHttpClient {
    routes: Arc<Mutex<BTreeMap<String, MockReply>>>,
    handlers: Vec<Handler>,
    recorded: Arc<Mutex<Vec<HttpRequest>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MockHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHttpClient")
            .field("handlers", &self.handlers.len())
            .field("in_flight", &self.in_flight)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

impl MockHttpClient {
    /// Client with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer calls to `url` with `reply`.
    #[must_use]
    pub fn route(self, url: impl Into<String>, reply: MockReply) -> Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), reply);
        self
    }

    /// Answer calls for which `handler` returns a reply.
    #[must_use]
    pub fn handler(
        mut self,
        handler: impl Fn(&HttpRequest) -> Option<MockReply> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Every call received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls received for `url`.
    #[must_use]
    pub fn calls_to(&self, url: &str) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| request.url == url)
            .count()
    }

    /// Calls currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn reply_for(&self, request: &HttpRequest) -> MockReply {
        let routed = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.url)
            .cloned();
        routed
            .or_else(|| self.handlers.iter().find_map(|handler| handler(request)))
            .unwrap_or_else(|| MockReply::json(404, Value::String(format!("no mock route for {}", request.url))))
    }
}

impl HttpClient for MockHttpClient {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let reply = self.reply_for(&request);
            self.recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);

            if reply.delay > Duration::ZERO {
                tokio::time::sleep(reply.delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            reply.outcome
        })
    }
}

/// A bare GET request to `url`, for driving an [`HttpClient`] directly.
#[must_use]
pub fn get(url: impl Into<String>) -> HttpRequest {
    HttpRequest {
        method: Method::Get,
        url: url.into(),
        headers: BTreeMap::new(),
        query: BTreeMap::new(),
        body: None,
    }
}

/// Recording [`Publisher`].
#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    published: Arc<Mutex<Vec<(String, Value)>>>,
    failing_topics: Arc<Mutex<Vec<String>>>,
    next_offset: Arc<AtomicI64>,
}

impl MockPublisher {
    /// Publisher that acknowledges everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish to `topic`.
    #[must_use]
    pub fn failing_on(self, topic: impl Into<String>) -> Self {
        self.failing_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.into());
        self
    }

    /// Every acknowledged `(topic, payload)`, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Publisher for MockPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: &Value,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, PublishError>> + Send + '_>> {
        let topic = topic.to_string();
        let payload = payload.clone();
        Box::pin(async move {
            let failing = self
                .failing_topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&topic);
            if failing {
                return Err(PublishError::PublishFailed {
                    topic,
                    reason: "broker unavailable".to_string(),
                });
            }

            let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic.clone(), payload));
            Ok(PublishAck {
                topic,
                partition: 0,
                offset,
            })
        })
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    /// Install a test-writer `tracing` subscriber once per process.
    ///
    /// Honors `RUST_LOG`; defaults to `debug` for mediator crates.
    pub fn init_test_tracing() {
        TRACING.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mediator_engine=debug"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init();
        });
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use std::time::Duration;

    /// Any status a downstream service might plausibly return.
    pub fn status_code() -> impl Strategy<Value = u16> {
        prop_oneof![200u16..=204, 400u16..=404, 500u16..=504]
    }

    /// Per-item response delays, so items settle out of order.
    pub fn item_delays(max_items: usize) -> impl Strategy<Value = Vec<Duration>> {
        proptest::collection::vec((0u64..20).prop_map(Duration::from_millis), 0..=max_items)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, SteppingClock, test_clock, test_epoch};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn stepping_clock_advances_per_reading() {
        let clock = SteppingClock::new(test_epoch(), 5);
        let first = clock.now();
        let second = clock.now();
        assert_eq!((second - first).num_milliseconds(), 5);
    }

    #[tokio::test]
    async fn unmatched_calls_answer_404() {
        let http = MockHttpClient::new();
        let response = http.send(get("http://nowhere")).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(http.requests().len(), 1);
        assert_eq!(http.in_flight(), 0);
    }

    #[tokio::test]
    async fn handlers_see_the_request() {
        let http = MockHttpClient::new().handler(|request| {
            request
                .url
                .ends_with("/echo")
                .then(|| MockReply::json(200, json!({"method": request.method.as_str()})))
        });
        let response = http.send(get("http://svc/echo")).await.unwrap();
        assert_eq!(response.body, json!({"method": "GET"}));
    }

    #[tokio::test]
    async fn publisher_assigns_offsets_and_fails_configured_topics() {
        let publisher = MockPublisher::new().failing_on("broken");
        let ack = publisher.publish("audit", &json!({"a": 1})).await.unwrap();
        assert_eq!(ack.offset, 0);
        assert!(publisher.publish("broken", &json!({})).await.is_err());
        assert_eq!(publisher.published(), vec![("audit".to_string(), json!({"a": 1}))]);
    }
}
