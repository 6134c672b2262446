//! Per-transaction state.
//!
//! A [`TransactionState`] is created when an inbound call arrives, mutated in
//! place by both orchestration phases, and dropped once the outward response
//! has been sent. Nothing in it is shared between transactions.

use crate::error::MediatorError;
use crate::orchestration::OrchestrationEntry;
use crate::request::Method;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The inbound call that started the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRequest {
    /// HTTP method
    pub method: Method,
    /// Headers, keyed by lowercase name
    pub headers: BTreeMap<String, String>,
    /// Query string parameters
    pub query: Map<String, Value>,
    /// Parsed body
    pub body: Value,
}

impl InboundRequest {
    /// Create an inbound request with no headers, query or body.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: BTreeMap::new(),
            query: Map::new(),
            body: Value::Null,
        }
    }

    /// Add a header; the name is stored lowercase.
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: Value) -> Self {
        self.query.insert(name.into(), value);
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Look up a header, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Elapsed time, serialized as `{"milliseconds": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElapsedTime {
    /// Whole milliseconds
    pub milliseconds: i64,
}

/// Start, end and duration of one sub-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupTiming {
    /// When the call started
    pub request_start: DateTime<Utc>,
    /// When the call settled
    pub request_end: DateTime<Utc>,
    /// `request_end - request_start`
    pub request_duration: ElapsedTime,
}

impl LookupTiming {
    /// Timing of a call that ran from `start` to `end`.
    #[must_use]
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            request_start: start,
            request_end: end,
            request_duration: ElapsedTime {
                milliseconds: (end - start).num_milliseconds(),
            },
        }
    }
}

/// Timestamps gathered during the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    /// When the transaction started
    pub transaction_start: DateTime<Utc>,
    /// Per sub-call timing, by request id
    pub lookup_requests: BTreeMap<String, LookupTiming>,
}

/// Running status flags, exposed to expressions as the `state` namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupState {
    /// Highest status code observed so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_lookup_http_status: Option<u16>,
    /// Set once any call fails without a response
    #[serde(default)]
    pub current_lookup_network_error: bool,
}

impl LookupState {
    /// Fold an observed status into the running maximum.
    pub fn observe_status(&mut self, status: u16) {
        self.current_lookup_http_status = Some(
            self.current_lookup_http_status
                .map_or(status, |current| current.max(status)),
        );
    }

    /// Record a transport-level failure.
    pub const fn mark_network_error(&mut self) {
        self.current_lookup_network_error = true;
    }
}

/// Classification tag recorded for each response-phase outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouterResponseStatus {
    /// Primary call failed with a 5xx or no response
    PrimaryReqFailError,
    /// Primary call completed below 500
    PrimaryCompleted,
    /// Secondary call failed with a 5xx or no response
    SecondaryFailError,
    /// Secondary call completed below 500
    SecondaryCompleted,
}

impl fmt::Display for RouterResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::PrimaryReqFailError => "primaryReqFailError",
            Self::PrimaryCompleted => "primaryCompleted",
            Self::SecondaryFailError => "secondaryFailError",
            Self::SecondaryCompleted => "secondaryCompleted",
        };
        f.write_str(tag)
    }
}

/// The response that will be sent back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutwardResponse {
    /// HTTP status
    pub status: u16,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Value,
}

impl Default for OutwardResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }
}

impl OutwardResponse {
    /// Replace status, headers and body with a primary call's response.
    ///
    /// Any `transfer-encoding` header is dropped: the body has already been
    /// fully read, so chunked framing no longer applies.
    pub fn replace_with(&mut self, status: u16, headers: Option<&BTreeMap<String, String>>, body: Value) {
        if let Some(headers) = headers {
            for (name, value) in headers {
                if name.eq_ignore_ascii_case("transfer-encoding") {
                    continue;
                }
                self.headers.insert(name.clone(), value.clone());
            }
        }
        self.status = status;
        self.body = body;
    }
}

/// First segment of a path expression, selecting a root within the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Inbound body
    Payload,
    /// Inbound query parameters
    Query,
    /// Values produced by input transforms
    Transforms,
    /// Running status flags
    State,
    /// Lookup phase results
    LookupRequests,
    /// Downstream response body made available to mappings
    ResponseBody,
    /// Route parameters of the inbound URL
    UrlParams,
    /// Endpoint constants
    Constants,
    /// Collected timestamps
    Timestamps,
    /// Current fan-out item
    Item,
    /// Position of the current fan-out item
    ItemIndex,
}

impl Namespace {
    /// Every namespace, in data-context order.
    pub const ALL: [Self; 11] = [
        Self::Payload,
        Self::Query,
        Self::Transforms,
        Self::State,
        Self::LookupRequests,
        Self::ResponseBody,
        Self::UrlParams,
        Self::Constants,
        Self::Timestamps,
        Self::Item,
        Self::ItemIndex,
    ];

    /// Key of this namespace in the expression data context.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Payload => "payload",
            Self::Query => "query",
            Self::Transforms => "transforms",
            Self::State => "state",
            Self::LookupRequests => "lookupRequests",
            Self::ResponseBody => "responseBody",
            Self::UrlParams => "urlParams",
            Self::Constants => "constants",
            Self::Timestamps => "timestamps",
            Self::Item => "item",
            Self::ItemIndex => "itemIndex",
        }
    }
}

impl FromStr for Namespace {
    type Err = MediatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|namespace| namespace.key() == s)
            .ok_or_else(|| MediatorError::UnsupportedNamespace {
                namespace: s.to_string(),
            })
    }
}

/// Mutable state of one inbound transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionState {
    /// Unique transaction id, used in logs
    pub id: String,
    /// Endpoint name, used in logs, cache keys and audit record names
    pub endpoint: String,
    /// The inbound call
    pub request: InboundRequest,
    /// Values produced by input transforms
    pub transforms: Value,
    /// Downstream response body made available to mappings
    pub response_body: Value,
    /// Route parameters
    pub url_params: Value,
    /// Endpoint constants
    pub constants: Value,
    /// Collected timestamps
    pub timestamps: Timestamps,
    /// Running status flags
    pub state: LookupState,
    /// Lookup results by request id
    pub lookup_requests: Map<String, Value>,
    /// The outward response
    pub response: OutwardResponse,
    /// Classification tags, in merge order
    pub router_response_statuses: Vec<RouterResponseStatus>,
    /// Once set, no merge may touch the outward response
    pub has_primary_request: bool,
    /// Audit trail, in append order
    pub orchestrations: Vec<OrchestrationEntry>,
}

impl TransactionState {
    /// Start a transaction for `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, request: InboundRequest, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            request,
            transforms: Value::Object(Map::new()),
            response_body: Value::Null,
            url_params: Value::Object(Map::new()),
            constants: Value::Object(Map::new()),
            timestamps: Timestamps {
                transaction_start: started_at,
                lookup_requests: BTreeMap::new(),
            },
            state: LookupState::default(),
            lookup_requests: Map::new(),
            response: OutwardResponse::default(),
            router_response_statuses: Vec::new(),
            has_primary_request: false,
            orchestrations: Vec::new(),
        }
    }

    /// Set input transform values.
    #[must_use]
    pub fn with_transforms(mut self, transforms: Value) -> Self {
        self.transforms = transforms;
        self
    }

    /// Set endpoint constants.
    #[must_use]
    pub fn with_constants(mut self, constants: Value) -> Self {
        self.constants = constants;
        self
    }

    /// Set route parameters.
    #[must_use]
    pub fn with_url_params(mut self, url_params: Value) -> Self {
        self.url_params = url_params;
        self
    }

    /// Set the response body namespace.
    #[must_use]
    pub fn with_response_body(mut self, response_body: Value) -> Self {
        self.response_body = response_body;
        self
    }

    /// Root value of a namespace. `item` and `itemIndex` are always `null`
    /// here; fan-out contexts supply their own.
    #[must_use]
    pub fn namespace_root(&self, namespace: Namespace) -> Value {
        match namespace {
            Namespace::Payload => self.request.body.clone(),
            Namespace::Query => Value::Object(self.request.query.clone()),
            Namespace::Transforms => self.transforms.clone(),
            Namespace::State => serde_json::to_value(&self.state).unwrap_or(Value::Null),
            Namespace::LookupRequests => Value::Object(self.lookup_requests.clone()),
            Namespace::ResponseBody => self.response_body.clone(),
            Namespace::UrlParams => self.url_params.clone(),
            Namespace::Constants => self.constants.clone(),
            Namespace::Timestamps => serde_json::to_value(&self.timestamps).unwrap_or(Value::Null),
            Namespace::Item | Namespace::ItemIndex => Value::Null,
        }
    }

    /// Snapshot of every namespace plus `requestHeaders`, as handed to the
    /// expression evaluator.
    #[must_use]
    pub fn data_context(&self) -> Value {
        let mut data = Map::new();
        for namespace in Namespace::ALL {
            data.insert(namespace.key().to_string(), self.namespace_root(namespace));
        }
        data.insert(
            "requestHeaders".to_string(),
            serde_json::to_value(&self.request.headers).unwrap_or(Value::Null),
        );
        Value::Object(data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn observe_status_keeps_maximum() {
        let mut state = LookupState::default();
        state.observe_status(404);
        state.observe_status(200);
        state.observe_status(503);
        state.observe_status(201);
        assert_eq!(state.current_lookup_http_status, Some(503));
    }

    #[test]
    fn replace_with_strips_transfer_encoding() {
        let mut response = OutwardResponse::default();
        let headers = BTreeMap::from([
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);
        response.replace_with(201, Some(&headers), json!({"b": 2}));

        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({"b": 2}));
        assert!(!response.headers.keys().any(|k| k.eq_ignore_ascii_case("transfer-encoding")));
        assert_eq!(response.headers["content-type"], "application/json");
    }

    #[test]
    fn unknown_namespace_is_a_configuration_error() {
        let err = "body".parse::<Namespace>().unwrap_err();
        assert!(err.is_configuration());
        assert_eq!("lookupRequests".parse::<Namespace>().unwrap(), Namespace::LookupRequests);
    }

    #[test]
    fn data_context_exposes_every_namespace() {
        let request = InboundRequest::new(Method::Post)
            .with_header("X-Trace", "abc")
            .with_query("page", json!("2"))
            .with_body(json!({"name": "Ada"}));
        let tx = TransactionState::new("patients", request, started())
            .with_constants(json!({"system": "mpi"}));

        let data = tx.data_context();
        assert_eq!(data["payload"]["name"], "Ada");
        assert_eq!(data["query"]["page"], "2");
        assert_eq!(data["constants"]["system"], "mpi");
        assert_eq!(data["requestHeaders"]["x-trace"], "abc");
        assert_eq!(data["state"]["currentLookupNetworkError"], false);
        assert!(data["item"].is_null());
        assert!(data["itemIndex"].is_null());
        assert_eq!("itemIndex".parse::<Namespace>().unwrap(), Namespace::ItemIndex);
        assert_eq!(tx.request.header("x-TRACE"), Some("abc"));
    }

    #[test]
    fn timing_serializes_duration_object() {
        let start = started();
        let end = start + chrono::Duration::milliseconds(250);
        let timing = serde_json::to_value(LookupTiming::between(start, end)).unwrap();
        assert_eq!(timing["requestDuration"], json!({"milliseconds": 250}));
        assert!(timing["requestStart"].is_string());
    }

    proptest::proptest! {
        #[test]
        fn observed_maximum_is_order_independent(mut statuses in proptest::collection::vec(100u16..600, 1..20)) {
            let mut forward = LookupState::default();
            statuses.iter().for_each(|s| forward.observe_status(*s));
            statuses.reverse();
            let mut backward = LookupState::default();
            statuses.iter().for_each(|s| backward.observe_status(*s));

            proptest::prop_assert_eq!(forward.current_lookup_http_status, statuses.iter().copied().max());
            proptest::prop_assert_eq!(forward, backward);
        }
    }
}
