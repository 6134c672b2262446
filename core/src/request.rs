//! Request specifications.
//!
//! A [`RequestSpec`] describes one downstream sub-call. Specs are loaded from
//! the persisted `{lookup: [...], response: [...]}` document through
//! [`PhaseRequests::from_json`], which validates every entry and resolves the
//! kind of call (HTTP or publish) once, up front.
//!
//! # Example
//!
//! ```
//! use mediator_core::request::{CallKind, PhaseRequests};
//! use serde_json::json;
//!
//! let requests = PhaseRequests::from_json(&json!({
//!     "lookup": [{
//!         "id": "patient",
//!         "config": {"method": "get", "url": "http://registry/patients/:id",
//!                    "params": {"url": {"id": {"path": "payload.patientId"}}}}
//!     }],
//!     "response": [{"id": "audit", "kafkaProducerTopic": "audit-events"}]
//! }))
//! .unwrap();
//!
//! assert!(matches!(requests.lookup[0].kind, CallKind::Http(_)));
//! assert!(matches!(requests.response[0].kind, CallKind::Publish(_)));
//! ```

use crate::error::SpecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

/// The two batches of sub-calls around the business transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Before the business transform
    Lookup,
    /// After the business transform
    Response,
}

impl Phase {
    /// Lowercase phase name, used in cache keys and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Response => "response",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method of a downstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl Method {
    /// Uppercase method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(s.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in `allowedStatuses`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStatusPattern", into = "String")]
pub enum StatusPattern {
    /// Exact code, compared as a string
    Exact(String),
    /// Any code whose first digit matches, written `"<digit>xx"`
    Class(char),
}

impl StatusPattern {
    /// Whether `status` matches this pattern.
    #[must_use]
    pub fn matches(&self, status: u16) -> bool {
        let status = status.to_string();
        match self {
            Self::Exact(code) => *code == status,
            Self::Class(digit) => status.starts_with(*digit),
        }
    }
}

impl FromStr for StatusPattern {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        match (chars.next(), chars.as_str()) {
            (Some(digit), rest) if digit.is_ascii_digit() && rest.eq_ignore_ascii_case("xx") => {
                Ok(Self::Class(digit))
            }
            _ if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
                Ok(Self::Exact(s.to_string()))
            }
            _ => Err(SpecError::InvalidStatusPattern(s.to_string())),
        }
    }
}

impl From<StatusPattern> for String {
    fn from(pattern: StatusPattern) -> Self {
        match pattern {
            StatusPattern::Exact(code) => code,
            StatusPattern::Class(digit) => format!("{digit}xx"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatusPattern {
    Code(u16),
    Text(String),
}

impl TryFrom<RawStatusPattern> for StatusPattern {
    type Error = SpecError;

    fn try_from(raw: RawStatusPattern) -> Result<Self, Self::Error> {
        match raw {
            RawStatusPattern::Code(code) => Ok(Self::Exact(code.to_string())),
            RawStatusPattern::Text(text) => text.parse(),
        }
    }
}

/// Ordered set of accepted statuses for one call.
///
/// An empty policy accepts exactly the 2xx range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusPolicy {
    patterns: Vec<StatusPattern>,
}

impl StatusPolicy {
    /// Build a policy from patterns, keeping the first occurrence of duplicates.
    #[must_use]
    pub fn new(patterns: Vec<StatusPattern>) -> Self {
        let mut unique: Vec<StatusPattern> = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if !unique.contains(&pattern) {
                unique.push(pattern);
            }
        }
        Self { patterns: unique }
    }

    /// Whether a response with `status` counts as a success.
    #[must_use]
    pub fn accepts(&self, status: u16) -> bool {
        if self.patterns.is_empty() {
            return (200..300).contains(&status);
        }
        self.patterns.iter().any(|pattern| pattern.matches(status))
    }

    /// The configured patterns.
    #[must_use]
    pub fn patterns(&self) -> &[StatusPattern] {
        &self.patterns
    }
}

/// Where a URL or query parameter takes its value from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Namespaced path, e.g. `payload.patient.id`
    pub path: String,
    /// Text prepended to the resolved value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Text appended to the resolved value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postfix: Option<String>,
}

impl ParamSpec {
    /// Render a resolved value with the configured prefix and postfix.
    #[must_use]
    pub fn format(&self, value: &Value) -> String {
        format!(
            "{}{}{}",
            self.prefix.as_deref().unwrap_or_default(),
            crate::plain_string(value),
            self.postfix.as_deref().unwrap_or_default()
        )
    }
}

/// Query and URL parameter mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Query parameters, by name
    #[serde(default)]
    pub query: BTreeMap<String, ParamSpec>,
    /// `:name` URL tokens, by name
    #[serde(default)]
    pub url: BTreeMap<String, ParamSpec>,
}

/// Array fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForEach {
    /// Namespaced path of the array to fan out over
    pub items: String,
    /// Maximum in-flight item calls; `None` uses the engine default
    pub concurrency: Option<NonZeroUsize>,
}

impl ForEach {
    /// Effective concurrency limit.
    #[must_use]
    pub fn concurrency_or(&self, default: NonZeroUsize) -> NonZeroUsize {
        self.concurrency.unwrap_or(default)
    }
}

/// An HTTP sub-call target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCall {
    /// URL, possibly an expression and/or containing `:param` tokens
    pub url: String,
    /// HTTP method
    pub method: Method,
}

/// A publish-only sub-call target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    /// Topic the resolved body is published to
    pub topic: String,
}

/// What executing a spec means, decided once when the spec is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    /// Send an HTTP request
    Http(HttpCall),
    /// Publish the resolved body to a queue topic
    Publish(PublishCall),
}

/// Validated configuration for one sub-call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// Identifier, unique within its phase; the aggregation and merge key
    pub id: String,
    /// Whether this call's response replaces the outward response wholesale
    pub primary: bool,
    /// HTTP call or publish call
    pub kind: CallKind,
    /// Header values; each may be an expression over transaction state
    pub headers: BTreeMap<String, String>,
    /// Transform expression applied to the call body
    pub body: Option<String>,
    /// Query and URL parameter mappings
    pub params: Params,
    /// Guard expression; a falsy result excludes the spec from dispatch
    pub condition: Option<String>,
    /// Statuses counted as success
    pub allowed_statuses: StatusPolicy,
    /// Reuse the inbound body as the call body root
    pub forward_existing_request_body: bool,
    /// Array fan-out settings
    pub for_each: Option<ForEach>,
}

impl RequestSpec {
    /// Parse and validate a single spec document.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError`] when the document is malformed.
    pub fn from_json(value: &Value) -> Result<Self, SpecError> {
        let document: RequestSpecDocument = serde_json::from_value(value.clone())
            .map_err(|e| SpecError::InvalidDocument(e.to_string()))?;
        Self::try_from(document)
    }

    /// Whether this spec fans out over an array.
    #[must_use]
    pub const fn is_fan_out(&self) -> bool {
        self.for_each.is_some()
    }
}

/// Request specification as persisted (camelCase JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpecDocument {
    /// Identifier
    pub id: String,
    /// Primary marker
    #[serde(default)]
    pub primary: bool,
    /// Call configuration
    #[serde(default)]
    pub config: RequestConfigDocument,
    /// Accepted statuses
    #[serde(default)]
    pub allowed_statuses: Vec<StatusPattern>,
    /// Reuse inbound body
    #[serde(default)]
    pub forward_existing_request_body: bool,
    /// Fan-out settings
    #[serde(default)]
    pub for_each: Option<ForEachDocument>,
    /// Publish topic; turns the spec into a publish call
    #[serde(default)]
    pub kafka_producer_topic: Option<String>,
}

/// The `config` block of a persisted request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestConfigDocument {
    /// Target URL
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP method, case-insensitive
    #[serde(default)]
    pub method: Option<String>,
    /// Header values or expressions
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body transform expression
    #[serde(default)]
    pub body: Option<String>,
    /// Parameter mappings
    #[serde(default)]
    pub params: Params,
    /// Guard expression
    #[serde(default)]
    pub condition: Option<String>,
}

/// The `forEach` block of a persisted request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForEachDocument {
    /// Items path
    pub items: String,
    /// Concurrency limit
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl TryFrom<RequestSpecDocument> for RequestSpec {
    type Error = SpecError;

    fn try_from(document: RequestSpecDocument) -> Result<Self, Self::Error> {
        let RequestSpecDocument {
            id,
            primary,
            config,
            allowed_statuses,
            forward_existing_request_body,
            for_each,
            kafka_producer_topic,
        } = document;

        if id.trim().is_empty() {
            return Err(SpecError::EmptyId);
        }

        let kind = match (kafka_producer_topic, &config.url, &config.method) {
            (Some(topic), _, _) if !topic.is_empty() => CallKind::Publish(PublishCall { topic }),
            (_, Some(url), Some(method)) if !url.is_empty() => {
                let method = method.parse().map_err(|method| SpecError::UnsupportedMethod {
                    id: id.clone(),
                    method,
                })?;
                CallKind::Http(HttpCall {
                    url: url.clone(),
                    method,
                })
            }
            _ => return Err(SpecError::MissingTarget { id }),
        };

        let for_each = match for_each {
            Some(ForEachDocument { items, concurrency }) => {
                let concurrency = match concurrency {
                    None => None,
                    Some(n) => Some(
                        NonZeroUsize::new(n)
                            .ok_or_else(|| SpecError::ZeroConcurrency { id: id.clone() })?,
                    ),
                };
                Some(ForEach { items, concurrency })
            }
            None => None,
        };

        Ok(Self {
            id,
            primary,
            kind,
            headers: config.headers,
            body: config.body.filter(|body| !body.trim().is_empty()),
            params: config.params,
            condition: config.condition.filter(|c| !c.trim().is_empty()),
            allowed_statuses: StatusPolicy::new(allowed_statuses),
            forward_existing_request_body,
            for_each,
        })
    }
}

/// The lookup and response request lists of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseRequests {
    /// Calls made before the business transform
    pub lookup: Vec<RequestSpec>,
    /// Calls made after the business transform
    pub response: Vec<RequestSpec>,
}

impl PhaseRequests {
    /// Parse and validate a `{lookup: [...], response: [...]}` document.
    ///
    /// Either list may be missing or `null`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError`] when any entry is malformed, when ids repeat
    /// within a phase, or when a phase has more than one primary request.
    pub fn from_json(value: &Value) -> Result<Self, SpecError> {
        let Value::Object(document) = value else {
            return Err(SpecError::InvalidDocument(
                "expected an object with lookup and response lists".to_string(),
            ));
        };

        let lookup = Self::parse_phase(document.get("lookup"), Phase::Lookup)?;
        let response = Self::parse_phase(document.get("response"), Phase::Response)?;
        Ok(Self { lookup, response })
    }

    /// Specs of one phase.
    #[must_use]
    pub fn phase(&self, phase: Phase) -> &[RequestSpec] {
        match phase {
            Phase::Lookup => &self.lookup,
            Phase::Response => &self.response,
        }
    }

    fn parse_phase(list: Option<&Value>, phase: Phase) -> Result<Vec<RequestSpec>, SpecError> {
        let entries = match list {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(SpecError::InvalidDocument(format!(
                    "{phase} requests must be an array"
                )));
            }
        };

        let specs = entries
            .iter()
            .map(RequestSpec::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        validate_phase(&specs, phase)?;
        Ok(specs)
    }
}

/// Check the per-phase invariants: unique ids and at most one primary.
///
/// # Errors
///
/// Returns [`SpecError::DuplicateId`] or [`SpecError::MultiplePrimaries`].
pub fn validate_phase(specs: &[RequestSpec], phase: Phase) -> Result<(), SpecError> {
    let mut seen = HashSet::new();
    let mut primary: Option<&str> = None;

    for spec in specs {
        if !seen.insert(spec.id.as_str()) {
            return Err(SpecError::DuplicateId {
                id: spec.id.clone(),
                phase,
            });
        }
        if spec.primary {
            if let Some(first) = primary {
                return Err(SpecError::MultiplePrimaries {
                    phase,
                    first: first.to_string(),
                    second: spec.id.clone(),
                });
            }
            primary = Some(spec.id.as_str());
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_patterns_parse_codes_and_classes() {
        let policy: StatusPolicy = serde_json::from_value(json!([404, "2xx", "5XX"])).unwrap();
        assert!(policy.accepts(404));
        assert!(policy.accepts(201));
        assert!(policy.accepts(503));
        assert!(!policy.accepts(400));
        assert_eq!(policy.patterns().len(), 3);
    }

    #[test]
    fn empty_policy_accepts_only_2xx() {
        let policy = StatusPolicy::default();
        assert!(policy.accepts(200));
        assert!(policy.accepts(299));
        assert!(!policy.accepts(300));
        assert!(!policy.accepts(199));
    }

    #[test]
    fn duplicate_patterns_are_collapsed() {
        let policy = StatusPolicy::new(vec![
            StatusPattern::Class('2'),
            StatusPattern::Exact("404".to_string()),
            StatusPattern::Class('2'),
        ]);
        assert_eq!(policy.patterns().len(), 2);
    }

    #[test]
    fn invalid_status_pattern_is_rejected() {
        assert!("abc".parse::<StatusPattern>().is_err());
        assert!("2x".parse::<StatusPattern>().is_err());
        assert!("".parse::<StatusPattern>().is_err());
    }

    #[test]
    fn http_spec_is_resolved_once() {
        let spec = RequestSpec::from_json(&json!({
            "id": "patient",
            "primary": true,
            "config": {
                "method": "post",
                "url": "http://registry/patients",
                "headers": {"content-type": "application/json"},
                "body": "$",
                "condition": "payload.enabled"
            },
            "allowedStatuses": ["2xx", 409],
            "forwardExistingRequestBody": true,
            "forEach": {"items": "payload.list", "concurrency": 3}
        }))
        .unwrap();

        assert_eq!(spec.id, "patient");
        assert!(spec.primary);
        assert_eq!(
            spec.kind,
            CallKind::Http(HttpCall {
                url: "http://registry/patients".to_string(),
                method: Method::Post,
            })
        );
        assert_eq!(spec.condition.as_deref(), Some("payload.enabled"));
        assert!(spec.allowed_statuses.accepts(409));
        assert!(spec.forward_existing_request_body);
        let for_each = spec.for_each.unwrap();
        assert_eq!(for_each.items, "payload.list");
        assert_eq!(for_each.concurrency.map(NonZeroUsize::get), Some(3));
    }

    #[test]
    fn publish_topic_wins_over_http_config() {
        let spec = RequestSpec::from_json(&json!({
            "id": "events",
            "kafkaProducerTopic": "mapped",
            "config": {"url": "http://ignored", "method": "get"}
        }))
        .unwrap();
        assert_eq!(
            spec.kind,
            CallKind::Publish(PublishCall {
                topic: "mapped".to_string()
            })
        );
    }

    #[test]
    fn spec_without_target_is_rejected() {
        let err = RequestSpec::from_json(&json!({"id": "x", "config": {"url": "http://a"}}))
            .unwrap_err();
        assert_eq!(err, SpecError::MissingTarget { id: "x".to_string() });
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = RequestSpec::from_json(&json!({
            "id": "x",
            "config": {"url": "http://a", "method": "get"},
            "forEach": {"items": "payload.list", "concurrency": 0}
        }))
        .unwrap_err();
        assert_eq!(err, SpecError::ZeroConcurrency { id: "x".to_string() });
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = RequestSpec::from_json(&json!({
            "id": "x",
            "config": {"url": "http://a", "method": "fetch"}
        }))
        .unwrap_err();
        assert!(matches!(err, SpecError::UnsupportedMethod { .. }));
    }

    #[test]
    fn phase_document_rejects_two_primaries() {
        let err = PhaseRequests::from_json(&json!({
            "response": [
                {"id": "a", "primary": true, "config": {"url": "http://a", "method": "get"}},
                {"id": "b", "primary": true, "config": {"url": "http://b", "method": "get"}}
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, SpecError::MultiplePrimaries { .. }));
    }

    #[test]
    fn phase_document_rejects_duplicate_ids() {
        let err = PhaseRequests::from_json(&json!({
            "lookup": [
                {"id": "a", "config": {"url": "http://a", "method": "get"}},
                {"id": "a", "config": {"url": "http://b", "method": "get"}}
            ]
        }))
        .unwrap_err();
        assert_eq!(
            err,
            SpecError::DuplicateId {
                id: "a".to_string(),
                phase: Phase::Lookup
            }
        );
    }

    #[test]
    fn missing_phases_are_empty() {
        let requests = PhaseRequests::from_json(&json!({"lookup": null})).unwrap();
        assert!(requests.phase(Phase::Lookup).is_empty());
        assert!(requests.phase(Phase::Response).is_empty());
    }
}
