//! Error taxonomy for spec loading and transaction orchestration.
//!
//! [`SpecError`] covers malformed request documents and is raised once, when a
//! phase document is loaded. [`MediatorError`] covers everything that can go
//! wrong while a transaction is being orchestrated.

use crate::request::Phase;
use thiserror::Error;

/// Errors raised while loading request specifications.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// The phase document is not shaped like `{lookup: [...], response: [...]}`
    #[error("Invalid request document: {0}")]
    InvalidDocument(String),

    /// A request has an empty identifier
    #[error("Request identifier must not be empty")]
    EmptyId,

    /// A request is neither an HTTP call nor a publish call
    #[error("Request '{id}' needs either config.url and config.method, or kafkaProducerTopic")]
    MissingTarget {
        /// The offending request
        id: String,
    },

    /// A request names an HTTP method the mediator does not speak
    #[error("Request '{id}' uses unsupported method '{method}'")]
    UnsupportedMethod {
        /// The offending request
        id: String,
        /// The configured method
        method: String,
    },

    /// `forEach.concurrency` was zero
    #[error("Request '{id}' has forEach.concurrency of 0; it must be a positive integer")]
    ZeroConcurrency {
        /// The offending request
        id: String,
    },

    /// An `allowedStatuses` entry could not be parsed
    #[error("Invalid status pattern '{0}'")]
    InvalidStatusPattern(String),

    /// Two requests in the same phase share an identifier
    #[error("Duplicate request id '{id}' in {phase} phase")]
    DuplicateId {
        /// The shared identifier
        id: String,
        /// The phase both requests belong to
        phase: Phase,
    },

    /// More than one request in a phase is marked primary
    #[error("More than one primary request in {phase} phase: '{first}' and '{second}'")]
    MultiplePrimaries {
        /// The phase
        phase: Phase,
        /// First primary request
        first: String,
        /// Second primary request
        second: String,
    },
}

/// Errors raised while orchestrating a transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediatorError {
    /// A path expression used a namespace the mediator does not know.
    ///
    /// This indicates a malformed deployment artifact, not missing data.
    #[error("Unsupported Query Parameter Extract Type: {namespace}")]
    UnsupportedNamespace {
        /// The unknown first path segment
        namespace: String,
    },

    /// `forEach.items` did not resolve to an array
    #[error(
        "forEach.items could not be found at '{path}' for request '{id}' or the resolved value isn't an array"
    )]
    InvalidForEachItems {
        /// The fan-out request
        id: String,
        /// The configured items path
        path: String,
    },

    /// A lookup call answered with a status outside its allowed set
    #[error("Incorrect status code {status} from '{id}'. {message}")]
    LookupFailed {
        /// The failed request
        id: String,
        /// Status returned by the downstream service
        status: u16,
        /// Message extracted from the downstream body
        message: String,
    },

    /// A call was sent but no response came back
    #[error("No response from lookup '{id}'. {message}")]
    NoResponse {
        /// The failed request
        id: String,
        /// Transport error message
        message: String,
    },

    /// A call could not be sent at all
    #[error("Unhandled Error: {message}")]
    Unhandled {
        /// The failed request
        id: String,
        /// Setup error message
        message: String,
    },

    /// The business transform between the two phases failed
    #[error("Transform failed: {message}")]
    Transform {
        /// Transform error message
        message: String,
    },

    /// The task driving a call panicked or was cancelled
    #[error("Task for request '{id}' failed: {message}")]
    TaskFailed {
        /// The request whose task failed
        id: String,
        /// Join error message
        message: String,
    },

    /// A phase aborted; wraps the error that caused it
    #[error("Rejected {phase} phase: {source}")]
    PhaseAborted {
        /// The aborted phase
        phase: Phase,
        /// What caused the abort
        source: Box<MediatorError>,
    },
}

impl MediatorError {
    /// Wrap an error as the cause of a phase abort.
    ///
    /// Errors that already carry a phase are returned unchanged.
    #[must_use]
    pub fn phase_aborted(phase: Phase, source: Self) -> Self {
        match source {
            already @ Self::PhaseAborted { .. } => already,
            other => Self::PhaseAborted {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error comes from a malformed configuration.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::UnsupportedNamespace { .. } | Self::InvalidForEachItems { .. } => true,
            Self::PhaseAborted { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// The outward HTTP status this error maps to.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::LookupFailed { status, .. } => *status,
            Self::Transform { .. } => 400,
            Self::PhaseAborted { source, .. } => source.status_code(),
            Self::UnsupportedNamespace { .. }
            | Self::InvalidForEachItems { .. }
            | Self::NoResponse { .. }
            | Self::Unhandled { .. }
            | Self::TaskFailed { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_map_to_500() {
        let err = MediatorError::UnsupportedNamespace {
            namespace: "body".to_string(),
        };
        assert!(err.is_configuration());
        assert_eq!(err.status_code(), 500);
        assert_eq!(
            err.to_string(),
            "Unsupported Query Parameter Extract Type: body"
        );
    }

    #[test]
    fn lookup_failure_keeps_downstream_status() {
        let err = MediatorError::LookupFailed {
            id: "patient".to_string(),
            status: 404,
            message: "not found".to_string(),
        };
        let wrapped = MediatorError::phase_aborted(Phase::Lookup, err);
        assert_eq!(wrapped.status_code(), 404);
        assert!(!wrapped.is_configuration());
        assert!(wrapped.to_string().starts_with("Rejected lookup phase:"));
    }

    #[test]
    fn phase_abort_is_not_wrapped_twice() {
        let err = MediatorError::phase_aborted(
            Phase::Response,
            MediatorError::TaskFailed {
                id: "a".to_string(),
                message: "panicked".to_string(),
            },
        );
        let again = MediatorError::phase_aborted(Phase::Lookup, err.clone());
        assert_eq!(again, err);
    }
}
