//! Call dispatch.
//!
//! A [`DispatchPlan`] holds every resolved call of one request spec: one call,
//! or one per fan-out item. Each call runs on its own task; a semaphore
//! permit is acquired before the task is spawned, so at most `concurrency`
//! calls of a plan are in flight. Results come back in item order no matter
//! when they settle.

use crate::audit::timed;
use crate::classifier::{Outcome, TransportKind};
use crate::resolver::{CallTarget, ResolvedCall};
use crate::telemetry::EngineMetrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mediator_core::environment::Clock;
use mediator_core::http::HttpClient;
use mediator_core::publisher::Publisher;
use mediator_core::MediatorError;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Every call of one request spec.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    /// Spec identifier
    pub id: String,
    /// Whether the calls come from a fan-out
    pub fan_out: bool,
    /// Calls in item order
    pub calls: Vec<ResolvedCall>,
    /// Maximum calls in flight
    pub concurrency: NonZeroUsize,
}

/// One settled call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    /// The call as sent
    pub call: ResolvedCall,
    /// What came back
    pub outcome: Outcome,
    /// When the call started
    pub started_at: DateTime<Utc>,
    /// When the call settled
    pub ended_at: DateTime<Utc>,
}

/// Every settled call of one plan, in item order.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Spec identifier
    pub id: String,
    /// Whether the calls come from a fan-out
    pub fan_out: bool,
    /// Reports in item order
    pub reports: Vec<CallReport>,
    /// When dispatch started
    pub started_at: DateTime<Utc>,
    /// When the last call settled
    pub ended_at: DateTime<Utc>,
}

/// Executes plans against the injected transports.
#[derive(Clone)]
pub struct Dispatcher {
    http: Arc<dyn HttpClient>,
    publisher: Option<Arc<dyn Publisher>>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher over `http`, with an optional queue publisher.
    #[must_use]
    pub fn new(
        http: Arc<dyn HttpClient>,
        publisher: Option<Arc<dyn Publisher>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            publisher,
            clock,
            metrics: EngineMetrics,
        }
    }

    /// The clock used for call timing.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run every call of `plan`, at most `plan.concurrency` at a time.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::TaskFailed`] if a call task panicked or was
    /// cancelled. The remaining calls still run to completion.
    pub async fn dispatch(&self, plan: DispatchPlan) -> Result<Aggregate, MediatorError> {
        let DispatchPlan {
            id,
            fan_out,
            calls,
            concurrency,
        } = plan;
        let started_at = self.clock.now();
        let semaphore = Arc::new(Semaphore::new(concurrency.get()));
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| MediatorError::TaskFailed {
                    id: id.clone(),
                    message: e.to_string(),
                })?;
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let report = this.execute(call).await;
                drop(permit);
                report
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut failure = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(report) => reports.push(report),
                Err(join_error) => {
                    tracing::error!(request = %id, error = %join_error, "Call task failed");
                    failure.get_or_insert_with(|| MediatorError::TaskFailed {
                        id: id.clone(),
                        message: join_error.to_string(),
                    });
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        Ok(Aggregate {
            id,
            fan_out,
            reports,
            started_at,
            ended_at: self.clock.now(),
        })
    }

    async fn execute(&self, call: ResolvedCall) -> CallReport {
        let result = timed(self.clock.as_ref(), async {
            match &call.target {
                CallTarget::Http(request) => {
                    let response = self.http.send(request.clone()).await;
                    Outcome::from_http(response, &call.allowed_statuses)
                }
                CallTarget::Publish { topic, payload } => match &self.publisher {
                    Some(publisher) => Outcome::from_publish(publisher.publish(topic, payload).await),
                    None => Outcome::Transport {
                        kind: TransportKind::Publish,
                        message: format!("No publisher configured for topic '{topic}'"),
                    },
                },
            }
        })
        .await;

        let elapsed = (result.ended_at - result.started_at).to_std().unwrap_or_default();
        self.metrics.call(call.phase, result.output.label(), elapsed);

        match &result.output {
            Outcome::Success(response) => tracing::debug!(
                request = %call.id,
                item = ?call.index,
                status = response.status,
                "Call succeeded"
            ),
            Outcome::HttpFailure(response) => tracing::warn!(
                request = %call.id,
                item = ?call.index,
                status = response.status,
                "Call returned a rejected status"
            ),
            Outcome::Transport { kind, message } => tracing::warn!(
                request = %call.id,
                item = ?call.index,
                kind = ?kind,
                error = %message,
                "Call produced no response"
            ),
        }

        CallReport {
            call,
            outcome: result.output,
            started_at: result.started_at,
            ended_at: result.ended_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use mediator_core::Phase;
    use mediator_core::environment::SystemClock;
    use mediator_core::request::StatusPolicy;
    use mediator_testing::{MockHttpClient, MockPublisher, MockReply, get};
    use serde_json::json;
    use std::time::Duration;

    fn http_call(index: usize, url: &str) -> ResolvedCall {
        ResolvedCall {
            id: "fan".to_string(),
            phase: Phase::Lookup,
            index: Some(index),
            primary: false,
            target: CallTarget::Http(get(url)),
            allowed_statuses: StatusPolicy::default(),
        }
    }

    fn plan(calls: Vec<ResolvedCall>, concurrency: usize) -> DispatchPlan {
        DispatchPlan {
            id: "fan".to_string(),
            fan_out: true,
            calls,
            concurrency: NonZeroUsize::new(concurrency).unwrap(),
        }
    }

    #[tokio::test]
    async fn results_keep_item_order_and_respect_the_bound() {
        let http = MockHttpClient::new()
            .route("http://svc/0", MockReply::json(200, json!(0)).with_delay(Duration::from_millis(40)))
            .route("http://svc/1", MockReply::json(200, json!(1)).with_delay(Duration::from_millis(5)))
            .route("http://svc/2", MockReply::json(200, json!(2)).with_delay(Duration::from_millis(20)))
            .route("http://svc/3", MockReply::json(200, json!(3)));
        let dispatcher = Dispatcher::new(Arc::new(http.clone()), None, Arc::new(SystemClock));

        let calls = (0..4).map(|i| http_call(i, &format!("http://svc/{i}"))).collect();
        let aggregate = dispatcher.dispatch(plan(calls, 2)).await.unwrap();

        let bodies: Vec<_> = aggregate
            .reports
            .iter()
            .map(|report| report.outcome.response().unwrap().body.clone())
            .collect();
        assert_eq!(bodies, vec![json!(0), json!(1), json!(2), json!(3)]);
        assert_eq!(http.max_in_flight(), 2);
        assert_eq!(http.in_flight(), 0);
    }

    #[tokio::test]
    async fn publish_without_publisher_is_a_transport_failure() {
        let dispatcher = Dispatcher::new(Arc::new(MockHttpClient::new()), None, Arc::new(SystemClock));
        let call = ResolvedCall {
            target: CallTarget::Publish {
                topic: "events".to_string(),
                payload: json!({"a": 1}),
            },
            ..http_call(0, "unused")
        };
        let aggregate = dispatcher.dispatch(plan(vec![call], 1)).await.unwrap();
        assert!(matches!(
            aggregate.reports[0].outcome,
            Outcome::Transport {
                kind: TransportKind::Publish,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn publish_goes_to_the_publisher() {
        let publisher = MockPublisher::new();
        let dispatcher = Dispatcher::new(
            Arc::new(MockHttpClient::new()),
            Some(Arc::new(publisher.clone())),
            Arc::new(SystemClock),
        );
        let call = ResolvedCall {
            target: CallTarget::Publish {
                topic: "events".to_string(),
                payload: json!({"a": 1}),
            },
            ..http_call(0, "unused")
        };
        let aggregate = dispatcher.dispatch(plan(vec![call], 1)).await.unwrap();
        assert_eq!(aggregate.reports[0].outcome.response().unwrap().status, 200);
        assert_eq!(publisher.published(), vec![("events".to_string(), json!({"a": 1}))]);
    }

    #[tokio::test]
    async fn empty_plan_settles_immediately() {
        let dispatcher = Dispatcher::new(Arc::new(MockHttpClient::new()), None, Arc::new(SystemClock));
        let aggregate = dispatcher.dispatch(plan(Vec::new(), 3)).await.unwrap();
        assert!(aggregate.reports.is_empty());
        assert!(aggregate.fan_out);
    }
}
