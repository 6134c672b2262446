//! # Mediator Engine
//!
//! Orchestrates the external calls of a mediated transaction.
//!
//! A transaction runs in two phases around a business transform:
//!
//! 1. **Lookup**: every configured lookup request whose condition holds is
//!    resolved, dispatched and collected into `lookupRequests`. One failed
//!    lookup aborts the transaction once its siblings have settled.
//! 2. **Response**: after the transform, response requests are dispatched and
//!    merged into the outward response. A primary request's outcome replaces
//!    it; secondary outcomes are nested under their request id.
//!
//! Requests with `forEach` fan out over an array, with at most
//! `forEach.concurrency` calls in flight and results kept in item order.
//!
//! ## Example
//!
//! ```no_run
//! use mediator_core::transaction::InboundRequest;
//! use mediator_core::request::Method;
//! use mediator_core::{PhaseRequests, TransactionState, Utc};
//! use mediator_engine::{Engine, EngineConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder(EngineConfig::from_env()?).build()?;
//! let requests = PhaseRequests::from_json(&json!({
//!     "lookup": [{
//!         "id": "patient",
//!         "config": {
//!             "method": "get",
//!             "url": "http://registry/Patient/:id",
//!             "params": {"url": {"id": {"path": "payload.patientId"}}}
//!         }
//!     }]
//! }))?;
//!
//! let request = InboundRequest::new(Method::Post).with_body(json!({"patientId": "p-1"}));
//! let mut tx = TransactionState::new("patients", request, Utc::now());
//! engine
//!     .mediate(&mut tx, &requests, |tx| Ok(tx.lookup_requests.get("patient").cloned().unwrap_or_default()))
//!     .await
//!     .ok();
//! println!("{} {}", tx.response.status, tx.response.body);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod envelope;
pub mod resolver;
pub mod telemetry;

pub use catalog::{CatalogChange, RequestCatalog};
pub use classifier::{Outcome, TransportKind};
pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{Aggregate, CallReport, DispatchPlan, Dispatcher};
pub use engine::{BuildError, Engine, EngineBuilder};
pub use envelope::{ResponseEnvelope, StatusText};
pub use resolver::{CallTarget, ParameterResolver, ResolvedCall, Scope};
