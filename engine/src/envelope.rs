//! Correlation envelope emitted when auditing is active.
//!
//! Mediators calling this one recognize the envelope by its
//! `x-mediator-urn` key, parse `response.body` and splice `orchestrations`
//! into their own audit trail.

use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use mediator_core::environment::Clock;
use mediator_core::orchestration::OrchestrationEntry;
use mediator_core::transaction::RouterResponseStatus;
use mediator_core::TransactionState;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Overall outcome reported in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusText {
    /// Everything succeeded
    #[serde(rename = "Successful")]
    Successful,
    /// Calls completed but the outward status is an error
    #[serde(rename = "Completed")]
    Completed,
    /// A secondary call failed
    #[serde(rename = "Completed with error(s)")]
    CompletedWithErrors,
    /// The primary call failed
    #[serde(rename = "Failed")]
    Failed,
}

impl StatusText {
    /// Derive the status text from the response-phase tags and the outward status.
    #[must_use]
    pub fn derive(tags: &[RouterResponseStatus], status: u16) -> Self {
        if tags.contains(&RouterResponseStatus::PrimaryReqFailError) {
            return Self::Failed;
        }
        if tags.contains(&RouterResponseStatus::SecondaryFailError) {
            return Self::CompletedWithErrors;
        }
        match (tags.is_empty(), status < 400) {
            (_, true) => Self::Successful,
            (false, false) => Self::Completed,
            (true, false) => Self::Failed,
        }
    }
}

/// The outward response as carried inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvelopeResponse {
    /// Outward status
    pub status: u16,
    /// Outward headers
    pub headers: BTreeMap<String, String>,
    /// Outward body, as text
    pub body: String,
    /// When the envelope was built
    pub timestamp: DateTime<Utc>,
}

/// `{"x-mediator-urn", "status", "response", "orchestrations"}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    /// Identifies this mediator
    #[serde(rename = "x-mediator-urn")]
    pub urn: String,
    /// Overall outcome
    pub status: StatusText,
    /// The outward response
    pub response: EnvelopeResponse,
    /// The audit trail, in append order
    pub orchestrations: Vec<OrchestrationEntry>,
}

impl ResponseEnvelope {
    /// Wrap the outward response of `tx`.
    #[must_use]
    pub fn build(config: &EngineConfig, tx: &TransactionState, clock: &dyn Clock) -> Self {
        let body = match &tx.response.body {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            urn: config.mediator_urn.clone(),
            status: StatusText::derive(&tx.router_response_statuses, tx.response.status),
            response: EnvelopeResponse {
                status: tx.response.status,
                headers: tx.response.headers.clone(),
                body,
                timestamp: clock.now(),
            },
            orchestrations: tx.orchestrations.clone(),
        }
    }

    /// The envelope as JSON.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
