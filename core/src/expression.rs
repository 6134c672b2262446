//! Expression evaluator boundary.
//!
//! Expressions appear in header values, body transforms, URLs and conditions.
//! They are compiled once per cache key and executed many times. Every use
//! inside the engine goes through [`ExpressionEvaluator::soft_evaluate`]: a
//! failed evaluation is never fatal, it just leaves the field unchanged.

use serde_json::Value;
use thiserror::Error;

/// Errors raised by an expression evaluator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// The expression text could not be compiled
    #[error("Cannot parse expression '{expression}': {reason}")]
    Parse {
        /// The expression text
        expression: String,
        /// What went wrong
        reason: String,
    },

    /// The expression compiled but failed against the given data
    #[error("Evaluation failed: {reason}")]
    Evaluation {
        /// What went wrong
        reason: String,
    },
}

/// Result of an evaluation that is not allowed to fail.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftEvaluation {
    /// The evaluated value; `Null` when evaluation failed
    pub value: Value,
    /// Whether evaluation succeeded
    pub ok: bool,
}

impl SoftEvaluation {
    /// The value, if evaluation succeeded and produced something non-null.
    #[must_use]
    pub fn usable(self) -> Option<Value> {
        if self.ok && !self.value.is_null() {
            Some(self.value)
        } else {
            None
        }
    }
}

/// Compile-once, execute-many expression service.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against `data`, compiling it under `key` on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] on invalid syntax or evaluation failure.
    fn execute(&self, key: &str, expression: &str, data: &Value) -> Result<Value, ExpressionError>;

    /// Whether a compiled form is cached under `key`.
    fn exists(&self, key: &str) -> bool;

    /// Evaluate without failing.
    fn soft_evaluate(&self, key: &str, expression: &str, data: &Value) -> SoftEvaluation {
        match self.execute(key, expression, data) {
            Ok(value) => SoftEvaluation { value, ok: true },
            Err(_) => SoftEvaluation {
                value: Value::Null,
                ok: false,
            },
        }
    }
}

/// JavaScript-style truthiness: `null`, `false`, `0`, `NaN` and `""` are
/// falsy, everything else (including empty arrays and objects) is truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
