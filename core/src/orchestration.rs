//! Audit records and the correlation envelope.
//!
//! When the inbound call carries the correlation header, every executed
//! sub-call leaves one [`OrchestrationRecord`] in the transaction's audit
//! trail. Downstream mediators answer in the same envelope shape this
//! mediator emits; [`unwrap_envelope`] recognizes it so the nested body can be
//! used as data and the nested audit trail spliced into ours.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Key identifying a mediator envelope.
pub const MEDIATOR_URN_KEY: &str = "x-mediator-urn";

/// One audit entry per executed sub-call. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRecord {
    /// e.g. `Endpoint Lookup Request: patients: fetch-patient`
    pub name: String,
    /// The resolved outbound call
    pub request_config: Value,
    /// `{status, headers, body}` when a response arrived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// When the call started
    pub started_at: DateTime<Utc>,
    /// When the call settled
    pub ended_at: DateTime<Utc>,
    /// `{message}` when the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// An entry in the transaction's audit trail.
///
/// Records spliced from a downstream envelope are kept verbatim, since their
/// shape is owned by whoever produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrchestrationEntry {
    /// A sub-call executed by this mediator
    Recorded(OrchestrationRecord),
    /// A record forwarded from a downstream envelope
    Forwarded(Value),
}

impl From<OrchestrationRecord> for OrchestrationEntry {
    fn from(record: OrchestrationRecord) -> Self {
        Self::Recorded(record)
    }
}

/// Recognize a lookup outcome `{data, headers}` whose `data` is a mediator
/// envelope.
///
/// Returns the replacement outcome `{data: <parsed body>}` together with the
/// envelope's audit trail, or `None` when the outcome is not an envelope or
/// its body is not stringified JSON.
#[must_use]
pub fn unwrap_envelope(outcome: &Value) -> Option<(Value, Vec<Value>)> {
    let data = outcome.get("data")?;
    data.get(MEDIATOR_URN_KEY).filter(|urn| is_present(urn))?;
    let body = data.get("response")?.get("body")?;
    let text = body.as_str().filter(|text| !text.is_empty())?;

    let parsed: Value = serde_json::from_str(text).ok()?;
    let trail = data
        .get("orchestrations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Some((json!({ "data": parsed }), trail))
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
