//! Phase sequencing.
//!
//! [`Engine`] owns the two phases of a transaction. Each phase filters its
//! specs by condition, resolves every call against a snapshot of the
//! transaction, dispatches all specs concurrently and merges each spec's
//! aggregate into the transaction as it settles. Merging happens on the
//! phase's own task, so the transaction has exactly one writer.

use crate::audit;
use crate::classifier;
use crate::config::{ConfigError, EngineConfig};
use crate::dispatcher::{Aggregate, DispatchPlan, Dispatcher};
use crate::envelope::ResponseEnvelope;
use crate::resolver::{ParameterResolver, ResolvedCall, Scope, forwarded_item_body};
use crate::telemetry::EngineMetrics;
use futures::stream::{FuturesUnordered, StreamExt};
use mediator_core::environment::{Clock, SystemClock};
use mediator_core::expression::ExpressionEvaluator;
use mediator_core::http::{HttpClient, HttpError};
use mediator_core::publisher::{PublishError, Publisher};
use mediator_core::{MediatorError, Phase, PhaseRequests, RequestSpec, TransactionState};
use mediator_expression::CachedEvaluator;
use mediator_http::ReqwestHttpClient;
use serde_json::{Map, Value, json};
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;

/// Errors raised while assembling an [`Engine`].
#[derive(Error, Debug)]
pub enum BuildError {
    /// The configuration did not validate
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built
    #[error("HTTP client: {0}")]
    Http(#[from] HttpError),

    /// The publisher could not be built
    #[error("Publisher: {0}")]
    Publish(#[from] PublishError),
}

/// Builder for [`Engine`]. Unset collaborators fall back to production ones.
pub struct EngineBuilder {
    config: EngineConfig,
    http: Option<Arc<dyn HttpClient>>,
    publisher: Option<Arc<dyn Publisher>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            http: None,
            publisher: None,
            evaluator: None,
            clock: None,
        }
    }

    /// Use `http` instead of a `reqwest` client built from the config.
    #[must_use]
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Publish queue-targeted requests through `publisher`.
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Use `evaluator` instead of the process-wide expression cache.
    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Use `clock` for every timestamp.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the config is invalid or a default
    /// collaborator cannot be created.
    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => {
                let mut builder = ReqwestHttpClient::builder()
                    .timeout(self.config.http.timeout())
                    .max_response_bytes(self.config.http.max_response_bytes);
                if !self.config.http.user_agent.is_empty() {
                    builder = builder.user_agent(self.config.http.user_agent.clone());
                }
                Arc::new(builder.build()?)
            }
        };

        let publisher = match self.publisher {
            Some(publisher) => Some(publisher),
            None => configured_publisher(&self.config)?,
        };

        let evaluator: Arc<dyn ExpressionEvaluator> = match self.evaluator {
            Some(evaluator) => evaluator,
            None => Arc::new(CachedEvaluator::global()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        tracing::info!(
            urn = %self.config.mediator_urn,
            publisher = publisher.is_some(),
            "Mediator engine ready"
        );

        Ok(Engine {
            dispatcher: Dispatcher::new(http, publisher, clock),
            config: Arc::new(self.config),
            evaluator,
            metrics: EngineMetrics,
        })
    }
}

#[cfg(feature = "kafka")]
fn configured_publisher(config: &EngineConfig) -> Result<Option<Arc<dyn Publisher>>, BuildError> {
    let Some(kafka) = &config.kafka else {
        return Ok(None);
    };
    let publisher: Arc<dyn Publisher> = Arc::new(
        mediator_redpanda::RedpandaPublisher::builder()
            .brokers(kafka.brokers.clone())
            .producer_acks(kafka.acks.clone())
            .compression(kafka.compression.clone())
            .timeout(std::time::Duration::from_millis(kafka.timeout_ms))
            .build()?,
    );
    Ok(Some(publisher))
}

#[cfg(not(feature = "kafka"))]
#[allow(clippy::unnecessary_wraps)]
fn configured_publisher(config: &EngineConfig) -> Result<Option<Arc<dyn Publisher>>, BuildError> {
    if config.kafka.is_some() {
        tracing::warn!("Kafka configured but the `kafka` feature is disabled; publish requests will fail");
    }
    Ok(None)
}

/// The orchestration engine.
///
/// Cheap to share behind an `Arc`; holds no per-transaction state.
pub struct Engine {
    config: Arc<EngineConfig>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    dispatcher: Dispatcher,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `tx` carries the correlation header, which switches auditing on.
    #[must_use]
    pub fn auditing(&self, tx: &TransactionState) -> bool {
        tx.request.header(&self.config.correlation_header).is_some()
    }

    /// Run the lookup phase.
    ///
    /// On success `lookupRequests` holds one entry per dispatched spec.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::PhaseAborted`] wrapping a configuration
    /// error, or the first failed lookup in dispatch order once every spec
    /// has settled.
    pub async fn run_lookup_phase(
        &self,
        tx: &mut TransactionState,
        specs: &[RequestSpec],
    ) -> Result<(), MediatorError> {
        let span = tracing::info_span!(
            "mediator.phase",
            phase = %Phase::Lookup,
            endpoint = %tx.endpoint,
            transaction = %tx.id
        );
        self.lookup_phase(tx, specs).instrument(span).await
    }

    /// Run the response phase.
    ///
    /// Skipped unless the outward status is 200. The outward body is cleared
    /// and rebuilt from the merged outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::PhaseAborted`] on a configuration error or a
    /// failed call task.
    pub async fn run_response_phase(
        &self,
        tx: &mut TransactionState,
        specs: &[RequestSpec],
    ) -> Result<(), MediatorError> {
        let span = tracing::info_span!(
            "mediator.phase",
            phase = %Phase::Response,
            endpoint = %tx.endpoint,
            transaction = %tx.id
        );
        self.response_phase(tx, specs).instrument(span).await
    }

    /// Lookup phase, business transform, response phase.
    ///
    /// `transform` sees the transaction after the lookup phase and returns
    /// the outward body, or an error message. Any abort leaves the outward
    /// response as `{error: <message>}` with the error's status, and is
    /// returned for the caller to log.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the transaction.
    pub async fn mediate<F>(
        &self,
        tx: &mut TransactionState,
        requests: &PhaseRequests,
        transform: F,
    ) -> Result<(), MediatorError>
    where
        F: FnOnce(&TransactionState) -> Result<Value, String>,
    {
        let result = self.mediate_inner(tx, requests, transform).await;
        if let Err(err) = &result {
            tracing::error!(
                endpoint = %tx.endpoint,
                transaction = %tx.id,
                status = err.status_code(),
                error = %err,
                "Transaction aborted"
            );
            tx.response.status = err.status_code();
            tx.response.body = json!({ "error": err.to_string() });
        }
        result
    }

    async fn mediate_inner<F>(
        &self,
        tx: &mut TransactionState,
        requests: &PhaseRequests,
        transform: F,
    ) -> Result<(), MediatorError>
    where
        F: FnOnce(&TransactionState) -> Result<Value, String>,
    {
        self.run_lookup_phase(tx, &requests.lookup).await?;

        let body = transform(tx).map_err(|message| MediatorError::Transform { message })?;
        tx.response.status = 200;
        tx.response.body = body;

        self.run_response_phase(tx, &requests.response).await
    }

    /// The correlation envelope for `tx`, when auditing is active.
    #[must_use]
    pub fn envelope(&self, tx: &TransactionState) -> Option<ResponseEnvelope> {
        self.auditing(tx)
            .then(|| ResponseEnvelope::build(&self.config, tx, self.dispatcher.clock()))
    }

    async fn lookup_phase(&self, tx: &mut TransactionState, specs: &[RequestSpec]) -> Result<(), MediatorError> {
        let phase = Phase::Lookup;
        let plans = match self.plan_phase(tx, specs, phase, &Value::Null) {
            Ok(plans) => plans,
            Err(err) => return Err(self.abort(phase, err)),
        };
        if plans.is_empty() {
            tracing::debug!("No lookup requests to make");
            return Ok(());
        }

        let auditing = self.auditing(tx);
        let mut entries = Map::new();
        let mut failure: Option<(usize, MediatorError)> = None;
        let mut pending = self.dispatch_all(plans);

        while let Some((order, result)) = pending.next().await {
            let collected = result.and_then(|aggregate| {
                settle(tx, &aggregate, auditing);
                classifier::collect_lookup(tx, &aggregate, auditing).map(|entry| (aggregate.id, entry))
            });
            match collected {
                Ok((id, entry)) => {
                    entries.insert(id, entry);
                }
                Err(err) => {
                    if failure.as_ref().is_none_or(|(first, _)| order < *first) {
                        failure = Some((order, err));
                    }
                }
            }
        }

        if let Some((_, err)) = failure {
            return Err(self.abort(phase, err));
        }

        tracing::info!(requests = entries.len(), "Lookup phase completed");
        tx.lookup_requests = entries;
        Ok(())
    }

    async fn response_phase(&self, tx: &mut TransactionState, specs: &[RequestSpec]) -> Result<(), MediatorError> {
        let phase = Phase::Response;
        if tx.response.status != 200 {
            tracing::debug!(status = tx.response.status, "Outward status is not 200, skipping response requests");
            return Ok(());
        }

        let mapped = tx.response.body.clone();
        let plans = match self.plan_phase(tx, specs, phase, &mapped) {
            Ok(plans) => plans,
            Err(err) => return Err(self.abort(phase, err)),
        };
        if plans.is_empty() {
            tracing::debug!("No response requests to make");
            return Ok(());
        }

        tx.response.body = Value::Object(Map::new());
        let auditing = self.auditing(tx);
        let mut failure: Option<(usize, MediatorError)> = None;
        let mut pending = self.dispatch_all(plans);

        while let Some((order, result)) = pending.next().await {
            match result {
                Ok(aggregate) => {
                    settle(tx, &aggregate, auditing);
                    classifier::merge_response(tx, &aggregate);
                }
                Err(err) => {
                    if failure.as_ref().is_none_or(|(first, _)| order < *first) {
                        failure = Some((order, err));
                    }
                }
            }
        }

        if let Some((_, err)) = failure {
            return Err(self.abort(phase, err));
        }

        tracing::info!(
            status = tx.response.status,
            primary = tx.has_primary_request,
            "Response phase completed"
        );
        Ok(())
    }

    /// Condition filtering and call resolution, against one snapshot.
    fn plan_phase(
        &self,
        tx: &TransactionState,
        specs: &[RequestSpec],
        phase: Phase,
        mapped_body: &Value,
    ) -> Result<Vec<DispatchPlan>, MediatorError> {
        let correlation = self.config.correlation_header.as_str();
        let mut resolver = ParameterResolver::new(self.evaluator.as_ref(), tx, phase);
        if let Some(value) = tx.request.header(correlation) {
            resolver = resolver.with_correlation(correlation, value);
        }
        let mut ctx = PlanContext {
            resolver,
            scope: Scope::new(tx),
            tx,
            phase,
            sole: false,
            mapped_body,
        };

        let active: Vec<&RequestSpec> = specs
            .iter()
            .filter(|spec| {
                let holds = ctx.resolver.condition_holds(spec, &ctx.scope);
                if !holds {
                    tracing::debug!(request = %spec.id, "Request excluded by its condition");
                }
                holds
            })
            .collect();
        self.metrics
            .conditions_excluded(phase, specs.len() - active.len());

        ctx.sole = active.len() == 1;
        active
            .into_iter()
            .map(|spec| self.plan_spec(&mut ctx, spec))
            .collect()
    }

    fn plan_spec(&self, ctx: &mut PlanContext<'_>, spec: &RequestSpec) -> Result<DispatchPlan, MediatorError> {
        let forward = spec.forward_existing_request_body;

        let Some(for_each) = &spec.for_each else {
            let body_root = match ctx.phase {
                Phase::Lookup => forward.then(|| ctx.tx.request.body.clone()),
                Phase::Response => Some(ctx.mapped_body.clone()),
            };
            let primary = ctx.phase == Phase::Response && (spec.primary || ctx.sole);
            let call = ctx.resolver.resolve(spec, &ctx.scope, body_root, None, primary)?;
            return Ok(DispatchPlan {
                id: spec.id.clone(),
                fan_out: false,
                calls: vec![call],
                concurrency: NonZeroUsize::MIN,
            });
        };

        let Value::Array(items) = ctx.scope.extract(&for_each.items)? else {
            return Err(MediatorError::InvalidForEachItems {
                id: spec.id.clone(),
                path: for_each.items.clone(),
            });
        };

        let calls = ctx.resolve_items(spec, items);
        ctx.scope.clear_item();

        Ok(DispatchPlan {
            id: spec.id.clone(),
            fan_out: true,
            calls: calls?,
            concurrency: for_each.concurrency_or(self.config.default_concurrency()),
        })
    }

    fn dispatch_all(
        &self,
        plans: Vec<DispatchPlan>,
    ) -> FuturesUnordered<impl Future<Output = (usize, Result<Aggregate, MediatorError>)> + '_> {
        plans
            .into_iter()
            .enumerate()
            .map(|(order, plan)| async move { (order, self.dispatcher.dispatch(plan).await) })
            .collect()
    }

    fn abort(&self, phase: Phase, err: MediatorError) -> MediatorError {
        self.metrics.phase_aborted(phase);
        let err = MediatorError::phase_aborted(phase, err);
        tracing::warn!(error = %err, "Phase aborted");
        err
    }
}

/// What every spec of one phase is planned against.
struct PlanContext<'a> {
    resolver: ParameterResolver<'a>,
    scope: Scope,
    tx: &'a TransactionState,
    phase: Phase,
    sole: bool,
    mapped_body: &'a Value,
}

impl PlanContext<'_> {
    /// One call per item, each resolved with the item slots pointing at it.
    fn resolve_items(&mut self, spec: &RequestSpec, items: Vec<Value>) -> Result<Vec<ResolvedCall>, MediatorError> {
        let forward = spec.forward_existing_request_body;
        let mut calls = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let body_root = match self.phase {
                Phase::Lookup => forward.then(|| forwarded_item_body(&self.tx.request.body, &item, index)),
                Phase::Response => Some(item.clone()),
            };
            self.scope.set_item(item, index);
            calls.push(self.resolver.resolve(spec, &self.scope, body_root, Some(index), false)?);
        }
        Ok(calls)
    }
}

/// Timing and audit records, common to both phases.
fn settle(tx: &mut TransactionState, aggregate: &Aggregate, auditing: bool) {
    audit::record_timing(tx, aggregate);
    if auditing {
        audit::record_aggregate(tx, aggregate);
    }
}
