//! Outcome classification and merging.
//!
//! Every settled call becomes an [`Outcome`]. Lookup outcomes are collected
//! into the `lookupRequests` namespace; response outcomes are merged into the
//! outward response, where the first primary to land locks it.

use crate::dispatcher::{Aggregate, CallReport};
use crate::telemetry::CallOutcomeLabel;
use mediator_core::http::{HttpError, HttpResponse};
use mediator_core::orchestration::{OrchestrationEntry, unwrap_envelope};
use mediator_core::publisher::{PublishAck, PublishError};
use mediator_core::request::StatusPolicy;
use mediator_core::transaction::{LookupState, RouterResponseStatus};
use mediator_core::{MediatorError, TransactionState, plain_string};
use serde_json::{Map, Value, json};

/// Why a call produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Sent, nothing came back
    NoResponse,
    /// Could not be sent
    Setup,
    /// The publisher rejected the message or none is configured
    Publish,
}

/// Classified result of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Response with an allowed status
    Success(HttpResponse),
    /// Response with a status outside the allowed set
    HttpFailure(HttpResponse),
    /// No response
    Transport {
        /// Failure kind
        kind: TransportKind,
        /// Error message
        message: String,
    },
}

impl Outcome {
    /// Classify an HTTP result against `policy`.
    #[must_use]
    pub fn from_http(result: Result<HttpResponse, HttpError>, policy: &StatusPolicy) -> Self {
        match result {
            Ok(response) if policy.accepts(response.status) => Self::Success(response),
            Ok(response) => Self::HttpFailure(response),
            Err(HttpError::NoResponse { message }) => Self::Transport {
                kind: TransportKind::NoResponse,
                message,
            },
            Err(HttpError::Setup { message }) => Self::Transport {
                kind: TransportKind::Setup,
                message,
            },
        }
    }

    /// Classify a publish result. An acknowledgement reads as a 200 whose
    /// body carries the broker coordinates.
    #[must_use]
    pub fn from_publish(result: Result<PublishAck, PublishError>) -> Self {
        match result {
            Ok(ack) => Self::Success(HttpResponse {
                status: 200,
                headers: std::collections::BTreeMap::new(),
                body: json!({
                    "topic": ack.topic,
                    "partition": ack.partition,
                    "offset": ack.offset,
                }),
            }),
            Err(err) => Self::Transport {
                kind: TransportKind::Publish,
                message: err.to_string(),
            },
        }
    }

    /// The response, if one arrived.
    #[must_use]
    pub const fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::Success(response) | Self::HttpFailure(response) => Some(response),
            Self::Transport { .. } => None,
        }
    }

    /// Whether this outcome fails a lookup.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Success(_))
    }

    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> CallOutcomeLabel {
        match self {
            Self::Success(_) => CallOutcomeLabel::Success,
            Self::HttpFailure(_) => CallOutcomeLabel::HttpFailure,
            Self::Transport { .. } => CallOutcomeLabel::Transport,
        }
    }

    /// Fold this outcome into the running status flags.
    pub fn observe(&self, state: &mut LookupState) {
        match self {
            Self::Success(response) | Self::HttpFailure(response) => state.observe_status(response.status),
            Self::Transport {
                kind: TransportKind::Setup,
                ..
            } => state.observe_status(500),
            Self::Transport { .. } => state.mark_network_error(),
        }
    }

    /// Message for the audit record's `error` field.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::HttpFailure(response) => Some(format!("Incorrect status code {}", response.status)),
            Self::Transport { message, .. } => Some(message.clone()),
        }
    }

    /// The error a failed lookup call aborts its phase with.
    #[must_use]
    pub fn lookup_error(&self, id: &str) -> Option<MediatorError> {
        match self {
            Self::Success(_) => None,
            Self::HttpFailure(response) => Some(MediatorError::LookupFailed {
                id: id.to_string(),
                status: response.status,
                message: response.body.get("message").map(plain_string).unwrap_or_default(),
            }),
            Self::Transport {
                kind: TransportKind::Setup,
                message,
            } => Some(MediatorError::Unhandled {
                id: id.to_string(),
                message: message.clone(),
            }),
            Self::Transport { message, .. } => Some(MediatorError::NoResponse {
                id: id.to_string(),
                message: message.clone(),
            }),
        }
    }

    fn router_status(&self, primary: bool) -> RouterResponseStatus {
        let failed = match self {
            Self::Success(response) | Self::HttpFailure(response) => response.status >= 500,
            Self::Transport { .. } => true,
        };
        match (primary, failed) {
            (true, true) => RouterResponseStatus::PrimaryReqFailError,
            (true, false) => RouterResponseStatus::PrimaryCompleted,
            (false, true) => RouterResponseStatus::SecondaryFailError,
            (false, false) => RouterResponseStatus::SecondaryCompleted,
        }
    }

    /// What a response-phase call contributes as body.
    fn contribution(&self) -> Value {
        match self {
            Self::Success(response) | Self::HttpFailure(response) => response.body.clone(),
            Self::Transport { message, .. } => Value::String(message.clone()),
        }
    }
}

/// Lookup entry `{data, headers}` for one successful call.
fn lookup_entry(response: &HttpResponse) -> Value {
    json!({
        "data": response.body,
        "headers": response.headers,
    })
}

/// Collect a lookup aggregate.
///
/// Updates the status flags for every call. Returns the first failure in
/// dispatch order, or the entry to store under the request id. When
/// `splice_trail` is set, audit trails of downstream mediator envelopes are
/// appended to the transaction's.
///
/// # Errors
///
/// Returns the lookup error of the first failed call.
pub fn collect_lookup(
    tx: &mut TransactionState,
    aggregate: &Aggregate,
    splice_trail: bool,
) -> Result<Value, MediatorError> {
    for report in &aggregate.reports {
        report.outcome.observe(&mut tx.state);
    }

    if let Some(err) = aggregate
        .reports
        .iter()
        .find_map(|report| report.outcome.lookup_error(&aggregate.id))
    {
        return Err(err);
    }

    let mut entries = aggregate
        .reports
        .iter()
        .filter_map(|report| report.outcome.response())
        .map(|response| unwrap_entry(tx, lookup_entry(response), splice_trail));

    if aggregate.fan_out {
        Ok(Value::Array(entries.collect()))
    } else {
        Ok(entries.next().unwrap_or(Value::Null))
    }
}

fn unwrap_entry(tx: &mut TransactionState, entry: Value, splice_trail: bool) -> Value {
    match unwrap_envelope(&entry) {
        Some((unwrapped, trail)) => {
            if splice_trail {
                tx.orchestrations
                    .extend(trail.into_iter().map(OrchestrationEntry::Forwarded));
            }
            unwrapped
        }
        None => entry,
    }
}

/// Merge a response aggregate into the outward response.
///
/// A primary outcome replaces status, headers and body and locks the
/// response. Secondary outcomes are nested under the request id until a
/// primary lands; fan-out items nest as one array.
pub fn merge_response(tx: &mut TransactionState, aggregate: &Aggregate) {
    for report in &aggregate.reports {
        report.outcome.observe(&mut tx.state);
        tx.router_response_statuses
            .push(report.outcome.router_status(report.call.primary));
    }

    if aggregate.fan_out {
        let items = aggregate
            .reports
            .iter()
            .map(|report| report.outcome.contribution())
            .collect();
        nest(tx, &aggregate.id, Value::Array(items));
        return;
    }

    for report in &aggregate.reports {
        if report.call.primary {
            apply_primary(tx, report);
        } else {
            nest(tx, &aggregate.id, report.outcome.contribution());
        }
    }
}

fn apply_primary(tx: &mut TransactionState, report: &CallReport) {
    if tx.has_primary_request {
        return;
    }
    match &report.outcome {
        Outcome::Success(response) | Outcome::HttpFailure(response) => {
            tx.response
                .replace_with(response.status, Some(&response.headers), response.body.clone());
        }
        Outcome::Transport { message, .. } => {
            tx.response.replace_with(500, None, Value::String(message.clone()));
        }
    }
    tx.has_primary_request = true;
}

fn nest(tx: &mut TransactionState, id: &str, contribution: Value) {
    if tx.has_primary_request {
        return;
    }
    if !tx.response.body.is_object() {
        tx.response.body = Value::Object(Map::new());
    }
    if let Value::Object(body) = &mut tx.response.body {
        body.insert(id.to_string(), contribution);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::resolver::{CallTarget, ResolvedCall};
    use mediator_core::Phase;
    use mediator_core::request::{Method, StatusPattern};
    use mediator_core::transaction::InboundRequest;
    use mediator_testing::{get, test_epoch};
    use std::collections::BTreeMap;

    fn response(status: u16, body: Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body,
        }
    }

    fn report(id: &str, primary: bool, outcome: Outcome) -> CallReport {
        CallReport {
            call: ResolvedCall {
                id: id.to_string(),
                phase: Phase::Response,
                index: None,
                primary,
                target: CallTarget::Http(get("http://svc")),
                allowed_statuses: StatusPolicy::default(),
            },
            outcome,
            started_at: test_epoch(),
            ended_at: test_epoch(),
        }
    }

    fn aggregate(id: &str, fan_out: bool, reports: Vec<CallReport>) -> Aggregate {
        Aggregate {
            id: id.to_string(),
            fan_out,
            reports,
            started_at: test_epoch(),
            ended_at: test_epoch(),
        }
    }

    fn transaction() -> TransactionState {
        let mut tx = TransactionState::new("ep", InboundRequest::new(Method::Post), test_epoch());
        tx.response.body = json!({});
        tx
    }

    #[test]
    fn classification_uses_the_allowed_statuses() {
        let default = StatusPolicy::default();
        assert!(matches!(Outcome::from_http(Ok(response(204, Value::Null)), &default), Outcome::Success(_)));
        assert!(matches!(Outcome::from_http(Ok(response(404, Value::Null)), &default), Outcome::HttpFailure(_)));

        let with_404 = StatusPolicy::new(vec![StatusPattern::Exact("404".to_string())]);
        assert!(matches!(Outcome::from_http(Ok(response(404, Value::Null)), &with_404), Outcome::Success(_)));
    }

    #[test]
    fn setup_errors_observe_500_and_transport_errors_set_the_flag() {
        let mut state = LookupState::default();
        Outcome::from_http(Err(HttpError::NoResponse { message: "reset".into() }), &StatusPolicy::default())
            .observe(&mut state);
        assert!(state.current_lookup_network_error);
        assert_eq!(state.current_lookup_http_status, None);

        Outcome::from_http(Err(HttpError::Setup { message: "bad url".into() }), &StatusPolicy::default())
            .observe(&mut state);
        assert_eq!(state.current_lookup_http_status, Some(500));
    }

    #[test]
    fn lookup_error_messages() {
        let failed = Outcome::HttpFailure(response(404, json!({"message": "Patient not found"})));
        let err = failed.lookup_error("fetch").unwrap();
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("Incorrect status code 404"));
        assert!(err.to_string().ends_with("Patient not found"));

        let setup = Outcome::Transport {
            kind: TransportKind::Setup,
            message: "builder error".to_string(),
        };
        assert_eq!(setup.lookup_error("fetch").unwrap().to_string(), "Unhandled Error: builder error");
    }

    #[test]
    fn lookup_entries_keep_data_and_headers() {
        let mut tx = transaction();
        let single = aggregate("a", false, vec![report("a", false, Outcome::Success(response(200, json!({"x": 1}))))]);
        let entry = collect_lookup(&mut tx, &single, false).unwrap();
        assert_eq!(entry["data"], json!({"x": 1}));
        assert_eq!(entry["headers"]["content-type"], "application/json");

        let fan_out = aggregate(
            "b",
            true,
            vec![
                report("b", false, Outcome::Success(response(200, json!(1)))),
                report("b", false, Outcome::Success(response(200, json!(2)))),
            ],
        );
        let entry = collect_lookup(&mut tx, &fan_out, false).unwrap();
        assert_eq!(entry[0]["data"], json!(1));
        assert_eq!(entry[1]["data"], json!(2));
    }

    #[test]
    fn first_failing_item_wins() {
        let mut tx = transaction();
        let fan_out = aggregate(
            "b",
            true,
            vec![
                report("b", false, Outcome::Success(response(200, json!(1)))),
                report("b", false, Outcome::HttpFailure(response(503, json!({"message": "down"})))),
                report("b", false, Outcome::HttpFailure(response(404, json!({})))),
            ],
        );
        let err = collect_lookup(&mut tx, &fan_out, false).unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert_eq!(tx.state.current_lookup_http_status, Some(503));
    }

    #[test]
    fn envelopes_are_unwrapped_and_trails_spliced() {
        let envelope = json!({
            "x-mediator-urn": "urn:mediator:downstream",
            "status": "Successful",
            "response": {"status": 200, "body": "{\"resourceType\":\"Patient\"}"},
            "orchestrations": [{"name": "nested"}]
        });
        let mut tx = transaction();
        let single = aggregate("a", false, vec![report("a", false, Outcome::Success(response(200, envelope.clone())))]);
        let entry = collect_lookup(&mut tx, &single, true).unwrap();
        assert_eq!(entry, json!({"data": {"resourceType": "Patient"}}));
        assert_eq!(tx.orchestrations, vec![OrchestrationEntry::Forwarded(json!({"name": "nested"}))]);

        let mut quiet = transaction();
        collect_lookup(&mut quiet, &single, false).unwrap();
        assert!(quiet.orchestrations.is_empty());
    }

    #[test]
    fn primary_locks_the_outward_response() {
        let mut tx = transaction();
        merge_response(&mut tx, &aggregate("p", false, vec![report("p", true, Outcome::Success(response(201, json!({"b": 2}))))]));
        merge_response(&mut tx, &aggregate("s", false, vec![report("s", false, Outcome::Success(response(200, json!({"a": 1}))))]));

        assert_eq!(tx.response.status, 201);
        assert_eq!(tx.response.body, json!({"b": 2}));
        assert!(tx.has_primary_request);
        assert_eq!(
            tx.router_response_statuses,
            vec![RouterResponseStatus::PrimaryCompleted, RouterResponseStatus::SecondaryCompleted]
        );
    }

    #[test]
    fn secondaries_nest_until_primary_arrives() {
        let mut tx = transaction();
        merge_response(&mut tx, &aggregate("s", false, vec![report("s", false, Outcome::HttpFailure(response(502, json!("bad gateway"))))]));
        assert_eq!(tx.response.body, json!({"s": "bad gateway"}));
        assert_eq!(tx.response.status, 200);
        assert_eq!(tx.router_response_statuses, vec![RouterResponseStatus::SecondaryFailError]);

        let failed = Outcome::Transport {
            kind: TransportKind::NoResponse,
            message: "timeout".to_string(),
        };
        merge_response(&mut tx, &aggregate("p", false, vec![report("p", true, failed)]));
        assert_eq!(tx.response.status, 500);
        assert_eq!(tx.response.body, json!("timeout"));
        assert!(tx.state.current_lookup_network_error);
    }

    #[test]
    fn fan_out_items_nest_as_an_array() {
        let mut tx = transaction();
        merge_response(
            &mut tx,
            &aggregate(
                "f",
                true,
                vec![
                    report("f", false, Outcome::Success(response(200, json!(1)))),
                    report("f", false, Outcome::HttpFailure(response(400, json!("no")))),
                ],
            ),
        );
        assert_eq!(tx.response.body, json!({"f": [1, "no"]}));
        assert_eq!(
            tx.router_response_statuses,
            vec![RouterResponseStatus::SecondaryCompleted, RouterResponseStatus::SecondaryCompleted]
        );
    }

    #[test]
    fn publish_ack_reads_as_200() {
        let outcome = Outcome::from_publish(Ok(PublishAck {
            topic: "t".to_string(),
            partition: 2,
            offset: 7,
        }));
        let response = outcome.response().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"topic": "t", "partition": 2, "offset": 7}));
    }
}
