//! # Mediator Core
//!
//! Core types and boundary traits for the lookup mediator.
//!
//! The mediator fans out a declaratively configured set of *lookup* calls
//! before the business transform runs, and a set of *response* calls after it
//! runs, merging their results into a single outward response. This crate holds
//! everything the orchestration engine and its collaborators agree on:
//!
//! - **Request specifications**: [`request::RequestSpec`] and the phase documents they load from
//! - **Transaction state**: [`transaction::TransactionState`], mutated in place through both phases
//! - **Audit records**: [`orchestration::OrchestrationRecord`] and the correlation envelope
//! - **Boundaries**: [`http::HttpClient`], [`publisher::Publisher`],
//!   [`expression::ExpressionEvaluator`] and [`environment::Clock`]
//! - **Errors**: [`error::MediatorError`] and [`error::SpecError`]
//!
//! ## Architecture Principles
//!
//! - Boundaries are traits, injected into the engine
//! - Configuration is validated once, when a spec is loaded
//! - Transaction state is owned by exactly one transaction

pub mod error;
pub mod expression;
pub mod http;
pub mod orchestration;
pub mod publisher;
pub mod request;
pub mod transaction;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{MediatorError, SpecError};
pub use request::{CallKind, Phase, PhaseRequests, RequestSpec};
pub use transaction::TransactionState;

/// Environment module - injected dependencies that are not part of any
/// downstream protocol.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use mediator_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Render a JSON value the way it is interpolated into URLs, query
/// parameters and header values.
///
/// Strings are used verbatim, arrays are joined with `,`, everything else
/// uses its JSON text.
#[must_use]
pub fn plain_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(plain_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_string_renders_scalars_and_arrays() {
        assert_eq!(plain_string(&json!("abc")), "abc");
        assert_eq!(plain_string(&json!(42)), "42");
        assert_eq!(plain_string(&json!(true)), "true");
        assert_eq!(plain_string(&json!(["a", 1])), "a,1");
        assert_eq!(plain_string(&json!(null)), "null");
    }
}
