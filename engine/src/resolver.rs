//! Parameter resolution.
//!
//! Turns a [`RequestSpec`] into a [`ResolvedCall`] by reading values out of a
//! [`Scope`] snapshot of the transaction. Header, body, URL and condition
//! expressions are soft-evaluated: a failure keeps the configured value.
//! Path lookups through an unknown namespace are fatal.

use jsonpath_rust::JsonPath;
use mediator_core::expression::ExpressionEvaluator;
use mediator_core::http::HttpRequest;
use mediator_core::plain_string;
use mediator_core::request::{CallKind, HttpCall, ParamSpec, RequestSpec, StatusPolicy};
use mediator_core::transaction::Namespace;
use mediator_core::{MediatorError, Phase, TransactionState};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Snapshot of the transaction's data context.
///
/// Every call of a phase is resolved against a scope taken before dispatch,
/// so in-flight calls never observe each other's results. A fan-out reuses
/// one scope and repoints its `item` and `itemIndex` slots per item.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    data: Value,
}

impl Scope {
    /// Snapshot `tx`.
    #[must_use]
    pub fn new(tx: &TransactionState) -> Self {
        Self {
            data: tx.data_context(),
        }
    }

    /// Fill the item slots with `item`, element `index` of a fan-out.
    /// Object items also carry their position as `itemIndex`.
    pub fn set_item(&mut self, mut item: Value, index: usize) {
        if let Value::Object(fields) = &mut item {
            fields.insert(Namespace::ItemIndex.key().to_string(), Value::from(index));
        }
        self.fill(Namespace::Item, item);
        self.fill(Namespace::ItemIndex, Value::from(index));
    }

    /// Empty the item slots.
    pub fn clear_item(&mut self) {
        self.fill(Namespace::Item, Value::Null);
        self.fill(Namespace::ItemIndex, Value::Null);
    }

    fn fill(&mut self, namespace: Namespace, value: Value) {
        if let Value::Object(map) = &mut self.data {
            match map.get_mut(namespace.key()) {
                Some(slot) => *slot = value,
                None => {
                    map.insert(namespace.key().to_string(), value);
                }
            }
        }
    }

    /// The full data context handed to expressions.
    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    /// Root value of one namespace.
    #[must_use]
    pub fn root(&self, namespace: Namespace) -> &Value {
        self.data.get(namespace.key()).unwrap_or(&Value::Null)
    }

    /// Resolve a namespaced path such as `payload.patient.ids[0]`.
    ///
    /// Missing data resolves to `null`.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::UnsupportedNamespace`] when the first segment
    /// is not a known namespace.
    pub fn extract(&self, path: &str) -> Result<Value, MediatorError> {
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        let namespace: Namespace = head.parse()?;
        Ok(query_path(self.root(namespace), rest))
    }
}

/// Read the value at `path` (dot-separated, with optional `[n]` indices)
/// below `root`. Missing data and unparseable paths read as `null`.
#[must_use]
pub fn query_path(root: &Value, path: &str) -> Value {
    let query = json_path(path);
    match query.parse::<JsonPath>() {
        Ok(compiled) => match compiled.find(root) {
            Value::Array(mut found) if !found.is_empty() => found.swap_remove(0),
            _ => Value::Null,
        },
        Err(err) => {
            tracing::debug!(path, error = %err, "Path could not be parsed, reading null");
            Value::Null
        }
    }
}

/// `patient.ids[0]` becomes `$['patient']['ids'][0]`; bare numeric
/// segments index arrays.
fn json_path(path: &str) -> String {
    let mut query = String::from("$");
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        let (name, indices) = split_indices(segment);
        match name {
            "" => {}
            index if index.bytes().all(|b| b.is_ascii_digit()) => query.push_str(&format!("[{index}]")),
            field => query.push_str(&format!("['{}']", field.replace('\'', "\\'"))),
        }
        for index in indices {
            query.push_str(&format!("[{index}]"));
        }
    }
    query
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(open) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let indices = segment[open..]
        .split(['[', ']'])
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect();
    (&segment[..open], indices)
}

/// Where a resolved call goes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CallTarget {
    /// An HTTP request
    Http(HttpRequest),
    /// A queue publish
    Publish {
        /// Destination topic
        topic: String,
        /// Message payload
        payload: Value,
    },
}

/// A call ready to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    /// Spec identifier
    pub id: String,
    /// Phase the call belongs to
    pub phase: Phase,
    /// Fan-out item index, `None` for single calls
    pub index: Option<usize>,
    /// Whether the outcome replaces the outward response
    pub primary: bool,
    /// Where the call goes
    pub target: CallTarget,
    /// Statuses counted as success
    pub allowed_statuses: StatusPolicy,
}

/// Resolves specs for one phase of one transaction.
pub struct ParameterResolver<'a> {
    evaluator: &'a dyn ExpressionEvaluator,
    endpoint: &'a str,
    phase: Phase,
    transaction: &'a str,
    correlation: Option<(&'a str, &'a str)>,
}

impl<'a> ParameterResolver<'a> {
    /// Resolver for `phase` of `tx`.
    #[must_use]
    pub fn new(evaluator: &'a dyn ExpressionEvaluator, tx: &'a TransactionState, phase: Phase) -> Self {
        Self {
            evaluator,
            endpoint: &tx.endpoint,
            phase,
            transaction: &tx.id,
            correlation: None,
        }
    }

    /// Propagate `name: value` to every HTTP call that does not configure `name`.
    #[must_use]
    pub const fn with_correlation(mut self, name: &'a str, value: &'a str) -> Self {
        self.correlation = Some((name, value));
        self
    }

    /// Stable expression cache key, e.g. `patients#lookup-fetch#header-accept`.
    #[must_use]
    pub fn cache_key(&self, id: &str, suffix: &str) -> String {
        format!("{}#{}-{id}#{suffix}", self.endpoint, self.phase)
    }

    /// Evaluate a spec's condition. A failed evaluation counts as satisfied.
    #[must_use]
    pub fn condition_holds(&self, spec: &RequestSpec, scope: &Scope) -> bool {
        let Some(condition) = &spec.condition else {
            return true;
        };
        let key = self.cache_key(&spec.id, "condition");
        let result = self.evaluator.soft_evaluate(&key, condition, scope.data());
        if !result.ok {
            tracing::debug!(
                endpoint = self.endpoint,
                transaction = self.transaction,
                request = %spec.id,
                condition = %condition,
                "Condition could not be evaluated, request kept"
            );
            return true;
        }
        mediator_core::expression::is_truthy(&result.value)
    }

    /// Resolve one call.
    ///
    /// `body_root` is the value the body expression runs against; `None`
    /// means the call carries no body.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::UnsupportedNamespace`] if a URL or query
    /// parameter path uses an unknown namespace.
    pub fn resolve(
        &self,
        spec: &RequestSpec,
        scope: &Scope,
        body_root: Option<Value>,
        index: Option<usize>,
        primary: bool,
    ) -> Result<ResolvedCall, MediatorError> {
        let body = self.body(spec, body_root);
        let target = match &spec.kind {
            CallKind::Http(http) => CallTarget::Http(HttpRequest {
                method: http.method,
                url: self.url(spec, http, scope)?,
                headers: self.headers(spec, scope),
                query: self.query(&spec.params.query, scope)?,
                body,
            }),
            CallKind::Publish(publish) => CallTarget::Publish {
                topic: publish.topic.clone(),
                payload: body.unwrap_or(Value::Null),
            },
        };

        Ok(ResolvedCall {
            id: spec.id.clone(),
            phase: self.phase,
            index,
            primary,
            target,
            allowed_statuses: spec.allowed_statuses.clone(),
        })
    }

    fn headers(&self, spec: &RequestSpec, scope: &Scope) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        for (name, configured) in &spec.headers {
            let key = self.cache_key(&spec.id, &format!("header-{name}"));
            let value = match self.evaluator.soft_evaluate(&key, configured, scope.data()).usable() {
                Some(value) => plain_string(&value),
                None => {
                    tracing::debug!(
                        endpoint = self.endpoint,
                        transaction = self.transaction,
                        request = %spec.id,
                        header = %name,
                        "Header expression yielded nothing, keeping configured value"
                    );
                    configured.clone()
                }
            };
            headers.insert(name.clone(), value);
        }

        if let Some((name, value)) = self.correlation {
            if !headers.keys().any(|existing| existing.eq_ignore_ascii_case(name)) {
                headers.insert(name.to_string(), value.to_string());
            }
        }
        headers
    }

    fn body(&self, spec: &RequestSpec, root: Option<Value>) -> Option<Value> {
        let root = root.filter(|root| !root.is_null())?;
        let Some(expression) = &spec.body else {
            return Some(root);
        };

        let key = self.cache_key(&spec.id, "body");
        let result = self.evaluator.soft_evaluate(&key, expression, &root);
        if result.ok {
            Some(result.value).filter(|value| !value.is_null())
        } else {
            tracing::debug!(
                endpoint = self.endpoint,
                transaction = self.transaction,
                request = %spec.id,
                "Body expression failed, forwarding body unchanged"
            );
            Some(root)
        }
    }

    fn url(&self, spec: &RequestSpec, http: &HttpCall, scope: &Scope) -> Result<String, MediatorError> {
        let key = self.cache_key(&spec.id, "url");
        let mut url = match self.evaluator.soft_evaluate(&key, &http.url, scope.data()).usable() {
            Some(value) if mediator_core::expression::is_truthy(&value) => plain_string(&value),
            _ => http.url.clone(),
        };

        // Longest names first so `:id` cannot clobber `:idx`.
        let mut params: Vec<(&String, &ParamSpec)> = spec.params.url.iter().collect();
        params.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        for (name, param) in params {
            let value = scope.extract(&param.path)?;
            if value.is_null() {
                continue;
            }
            url = url.replace(&format!(":{name}"), &param.format(&value));
        }

        tracing::debug!(
            endpoint = self.endpoint,
            transaction = self.transaction,
            request = %spec.id,
            url = %url,
            "Resolved request URL"
        );
        Ok(url)
    }

    fn query(
        &self,
        params: &BTreeMap<String, ParamSpec>,
        scope: &Scope,
    ) -> Result<BTreeMap<String, String>, MediatorError> {
        let mut query = BTreeMap::new();
        for (name, param) in params {
            let value = scope.extract(&param.path)?;
            if !value.is_null() {
                query.insert(name.clone(), param.format(&value));
            }
        }
        Ok(query)
    }
}

/// Body of one lookup fan-out item when the inbound body is forwarded: the
/// inbound payload plus `item` and `itemIndex`.
#[must_use]
pub fn forwarded_item_body(payload: &Value, item: &Value, index: usize) -> Value {
    let mut body = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => return other.clone(),
    };
    body.insert("item".to_string(), item.clone());
    body.insert("itemIndex".to_string(), Value::from(index));
    Value::Object(body)
}
