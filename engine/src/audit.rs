//! Audit trail and call timing.

use crate::dispatcher::{Aggregate, CallReport};
use chrono::{DateTime, Utc};
use mediator_core::environment::Clock;
use mediator_core::orchestration::{OrchestrationEntry, OrchestrationRecord};
use mediator_core::transaction::LookupTiming;
use mediator_core::{Phase, TransactionState};
use serde_json::{Value, json};
use std::future::Future;

/// Output of a future together with when it started and settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    /// The future's output
    pub output: T,
    /// Taken just before the first poll
    pub started_at: DateTime<Utc>,
    /// Taken right after completion
    pub ended_at: DateTime<Utc>,
}

/// Await `future`, reading `clock` on either side.
pub async fn timed<F: Future>(clock: &dyn Clock, future: F) -> Timed<F::Output> {
    let started_at = clock.now();
    let output = future.await;
    Timed {
        output,
        started_at,
        ended_at: clock.now(),
    }
}

/// `Endpoint Lookup Request: patients: fetch-patient`
#[must_use]
pub fn record_name(phase: Phase, endpoint: &str, id: &str) -> String {
    let phase = match phase {
        Phase::Lookup => "Lookup",
        Phase::Response => "Response",
    };
    format!("Endpoint {phase} Request: {endpoint}: {id}")
}

/// Audit record of one settled call.
#[must_use]
pub fn record(endpoint: &str, report: &CallReport) -> OrchestrationRecord {
    OrchestrationRecord {
        name: record_name(report.call.phase, endpoint, &report.call.id),
        request_config: serde_json::to_value(&report.call.target).unwrap_or(Value::Null),
        response: report.outcome.response().map(|response| {
            json!({
                "status": response.status,
                "headers": response.headers,
                "body": response.body,
            })
        }),
        started_at: report.started_at,
        ended_at: report.ended_at,
        error: report
            .outcome
            .error_message()
            .map(|message| json!({ "message": message })),
    }
}

/// Append one record per call of `aggregate`, in item order.
pub fn record_aggregate(tx: &mut TransactionState, aggregate: &Aggregate) {
    let records: Vec<OrchestrationEntry> = aggregate
        .reports
        .iter()
        .map(|report| record(&tx.endpoint, report).into())
        .collect();
    tx.orchestrations.extend(records);
}

/// Store the timing of `aggregate` under its request id. Fan-outs span from
/// dispatch until the last item settled.
pub fn record_timing(tx: &mut TransactionState, aggregate: &Aggregate) {
    let (start, end) = if aggregate.fan_out {
        (aggregate.started_at, aggregate.ended_at)
    } else {
        aggregate
            .reports
            .first()
            .map_or((aggregate.started_at, aggregate.ended_at), |report| {
                (report.started_at, report.ended_at)
            })
    };
    tx.timestamps
        .lookup_requests
        .insert(aggregate.id.clone(), LookupTiming::between(start, end));
}
