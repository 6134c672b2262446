//! Process-wide cache of compiled expressions.

use crate::Expression;
use mediator_core::expression::ExpressionError;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// The cache shared by every transaction in the process.
pub(crate) static GLOBAL: Lazy<ExpressionCache> = Lazy::new(ExpressionCache::default);

/// Compiled expressions by caller-supplied key.
///
/// Readers never block each other. A miss compiles outside the lock and then
/// inserts; two racing misses on the same key both compile and the second
/// insert wins, which is harmless because both compiled the same source.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    entries: RwLock<HashMap<String, Arc<Expression>>>,
}

impl ExpressionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The compiled form of `source` under `key`, compiling on miss.
    ///
    /// A key whose cached source differs from `source` is recompiled and
    /// replaced, so an edited spec never runs a stale expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`] when `source` does not compile.
    pub fn get_or_compile(&self, key: &str, source: &str) -> Result<Arc<Expression>, ExpressionError> {
        if let Some(compiled) = self.get(key).filter(|compiled| compiled.source() == source) {
            return Ok(compiled);
        }

        let compiled = Arc::new(Expression::compile(source)?);
        tracing::trace!(key, "compiled expression");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// The compiled expression under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Expression>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether `key` has been compiled.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of cached expressions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached expression.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
