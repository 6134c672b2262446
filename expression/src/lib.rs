//! # Mediator Expression
//!
//! A small path and function expression language used in request
//! specifications, compiled once per cache key and executed many times.
//!
//! ```text
//! payload.patient.id                       path into the data context
//! payload.items.code                       maps over arrays
//! payload.items[0]                         indexing, negative from the end
//! $uppercase(payload.name)                 built-in functions
//! constants.base & '/patients/' & item.id  string concatenation
//! state.currentLookupHttpStatus >= 400     comparison
//! $exists(payload.id) and query.force      logical operators
//! ```
//!
//! Text that is not an expression, such as a URL or `application/json`,
//! fails to compile; the engine treats that as "keep the configured value".
//!
//! # Example
//!
//! ```
//! use mediator_core::expression::ExpressionEvaluator;
//! use mediator_expression::CachedEvaluator;
//! use serde_json::json;
//!
//! let evaluator = CachedEvaluator::new();
//! let data = json!({"payload": {"name": "ada"}});
//! let value = evaluator
//!     .execute("patients#lookup-a#header-x-name", "$uppercase(payload.name)", &data)
//!     .unwrap();
//! assert_eq!(value, json!("ADA"));
//! assert!(evaluator.exists("patients#lookup-a#header-x-name"));
//! ```

mod cache;
mod eval;
mod lexer;
mod parser;

pub use cache::ExpressionCache;

use mediator_core::expression::{ExpressionError, ExpressionEvaluator};
use serde_json::Value;
use std::sync::Arc;

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: parser::Node,
}

impl Expression {
    /// Compile `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`] on invalid syntax or an unknown function.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let parse_error = |reason: String| ExpressionError::Parse {
            expression: source.to_string(),
            reason,
        };
        let tokens = lexer::tokenize(source).map_err(parse_error)?;
        let root = parser::parse(tokens).map_err(parse_error)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The text this expression was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `data`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Evaluation`] on a type error.
    pub fn evaluate(&self, data: &Value) -> Result<Value, ExpressionError> {
        eval::evaluate(&self.root, data).map_err(|reason| ExpressionError::Evaluation { reason })
    }
}

/// [`ExpressionEvaluator`] backed by an [`ExpressionCache`].
#[derive(Debug, Clone)]
pub struct CachedEvaluator {
    cache: Arc<ExpressionCache>,
}

impl CachedEvaluator {
    /// Evaluator with a private cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: Arc::new(ExpressionCache::new()),
        }
    }

    /// Evaluator sharing the process-wide cache.
    #[must_use]
    pub fn global() -> GlobalEvaluator {
        GlobalEvaluator
    }

    /// Evaluator over an existing cache.
    #[must_use]
    pub const fn with_cache(cache: Arc<ExpressionCache>) -> Self {
        Self { cache }
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &ExpressionCache {
        &self.cache
    }
}

impl Default for CachedEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for CachedEvaluator {
    fn execute(&self, key: &str, expression: &str, data: &Value) -> Result<Value, ExpressionError> {
        self.cache.get_or_compile(key, expression)?.evaluate(data)
    }

    fn exists(&self, key: &str) -> bool {
        self.cache.contains(key)
    }
}

/// [`ExpressionEvaluator`] over the process-wide cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalEvaluator;

impl ExpressionEvaluator for GlobalEvaluator {
    fn execute(&self, key: &str, expression: &str, data: &Value) -> Result<Value, ExpressionError> {
        cache::GLOBAL.get_or_compile(key, expression)?.evaluate(data)
    }

    fn exists(&self, key: &str) -> bool {
        cache::GLOBAL.contains(key)
    }
}
