//! Tree-walking evaluator.
//!
//! Missing data evaluates to `null` rather than failing; type errors (such as
//! `$uppercase` over an object) fail.

use crate::parser::{Builtin, CompareOp, Node, Step, number};
use mediator_core::expression::is_truthy;
use mediator_core::plain_string;
use serde_json::Value;
use std::cmp::Ordering;

pub(crate) fn evaluate(node: &Node, data: &Value) -> Result<Value, String> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Context => Ok(data.clone()),
        Node::Path(base, steps) => {
            let base = evaluate(base, data)?;
            Ok(steps.iter().fold(base, |value, step| navigate(value, step)))
        }
        Node::Call(builtin, args) => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, data))
                .collect::<Result<Vec<_>, _>>()?;
            call(*builtin, args)
        }
        Node::Concat(parts) => {
            let mut text = String::new();
            for part in parts {
                match evaluate(part, data)? {
                    Value::Null => {}
                    value => text.push_str(&plain_string(&value)),
                }
            }
            Ok(Value::String(text))
        }
        Node::Compare(op, lhs, rhs) => {
            let lhs = evaluate(lhs, data)?;
            let rhs = evaluate(rhs, data)?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
        Node::And(lhs, rhs) => Ok(Value::Bool(
            is_truthy(&evaluate(lhs, data)?) && is_truthy(&evaluate(rhs, data)?),
        )),
        Node::Or(lhs, rhs) => Ok(Value::Bool(
            is_truthy(&evaluate(lhs, data)?) || is_truthy(&evaluate(rhs, data)?),
        )),
    }
}

/// Apply one path step. Field steps map over arrays and flatten the results.
fn navigate(value: Value, step: &Step) -> Value {
    match (value, step) {
        (Value::Object(mut map), Step::Field(name)) => map.remove(name).unwrap_or(Value::Null),
        (Value::Array(items), Step::Field(_)) => {
            let mut collected = Vec::new();
            for item in items {
                match navigate(item, step) {
                    Value::Null => {}
                    Value::Array(nested) => collected.extend(nested),
                    other => collected.push(other),
                }
            }
            collapse(collected)
        }
        (Value::Array(items), Step::Index(index)) => {
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let resolved = if *index < 0 { len + index } else { *index };
            usize::try_from(resolved)
                .ok()
                .and_then(|i| items.into_iter().nth(i))
                .unwrap_or(Value::Null)
        }
        (Value::Null, _) => Value::Null,
        (scalar, Step::Index(0 | -1)) => scalar,
        _ => Value::Null,
    }
}

fn collapse(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.pop().unwrap_or(Value::Null),
        _ => Value::Array(values),
    }
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, String> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(false);
    }

    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(ordering)) => Ok(ordering == Ordering::Equal),
        (CompareOp::Ne, Some(ordering)) => Ok(ordering != Ordering::Equal),
        (CompareOp::Eq, None) => Ok(lhs == rhs),
        (CompareOp::Ne, None) => Ok(lhs != rhs),
        (CompareOp::Lt, Some(ordering)) => Ok(ordering == Ordering::Less),
        (CompareOp::Le, Some(ordering)) => Ok(ordering != Ordering::Greater),
        (CompareOp::Gt, Some(ordering)) => Ok(ordering == Ordering::Greater),
        (CompareOp::Ge, Some(ordering)) => Ok(ordering != Ordering::Less),
        (_, None) => Err(format!("cannot order {lhs} and {rhs}")),
    }
}

fn call(builtin: Builtin, mut args: Vec<Value>) -> Result<Value, String> {
    let second = if args.len() > 1 { args.pop() } else { None };
    let first = args.pop().unwrap_or(Value::Null);

    match builtin {
        Builtin::Uppercase => map_string(first, "uppercase", |s| s.to_uppercase()),
        Builtin::Lowercase => map_string(first, "lowercase", |s| s.to_lowercase()),
        Builtin::Trim => map_string(first, "trim", |s| s.trim().to_string()),
        Builtin::String => Ok(match first {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        }),
        Builtin::Number => match first {
            Value::Null => Ok(Value::Null),
            Value::Number(n) => Ok(Value::Number(n)),
            Value::Bool(b) => Ok(Value::from(u8::from(b))),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(number)
                .map_err(|_| format!("$number cannot convert '{s}'")),
            other => Err(format!("$number cannot convert {other}")),
        },
        Builtin::Boolean => Ok(Value::Bool(is_truthy(&first))),
        Builtin::Not => Ok(Value::Bool(!is_truthy(&first))),
        Builtin::Exists => Ok(Value::Bool(!first.is_null())),
        Builtin::Count => Ok(Value::from(match &first {
            Value::Null => 0,
            Value::Array(items) => items.len(),
            _ => 1,
        })),
        Builtin::Length => match first {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            other => Err(format!("$length expects a string, got {other}")),
        },
        Builtin::Join => {
            let separator = match second {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s,
                Some(other) => return Err(format!("$join separator must be a string, got {other}")),
            };
            let items = match first {
                Value::Null => return Ok(Value::Null),
                Value::Array(items) => items,
                single => vec![single],
            };
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(format!("$join expects strings, got {other}")),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|parts| Value::String(parts.join(&separator)))
        }
        Builtin::Contains => match (first, second) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::String(haystack), Some(Value::String(needle))) => {
                Ok(Value::Bool(haystack.contains(needle.as_str())))
            }
            (haystack, needle) => Err(format!("$contains expects strings, got {haystack} and {needle:?}")),
        },
    }
}

fn map_string(value: Value, name: &str, f: impl Fn(&str) -> String) -> Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(f(&s))),
        other => Err(format!("${name} expects a string, got {other}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use serde_json::json;

    fn run(source: &str, data: &Value) -> Result<Value, String> {
        evaluate(&parse(tokenize(source)?)?, data)
    }

    #[test]
    fn paths_map_over_arrays() {
        let data = json!({"payload": {"list": [{"id": "x"}, {"id": "y"}, {"other": 1}]}});
        assert_eq!(run("payload.list.id", &data).unwrap(), json!(["x", "y"]));
        assert_eq!(run("payload.list[1].id", &data).unwrap(), json!("y"));
        assert_eq!(run("payload.list[-1].other", &data).unwrap(), json!(1));
        assert_eq!(run("payload.missing.deeper", &data).unwrap(), Value::Null);
    }

    #[test]
    fn uppercase_rejects_non_strings() {
        let data = json!({"payload": {"name": {"given": "ada"}}});
        assert!(run("$uppercase(payload.name)", &data).is_err());
        assert_eq!(run("$uppercase(payload.name.given)", &data).unwrap(), json!("ADA"));
        assert_eq!(run("$uppercase(payload.absent)", &data).unwrap(), Value::Null);
    }

    #[test]
    fn concatenation_and_comparison() {
        let data = json!({"state": {"currentLookupHttpStatus": 404}, "constants": {"base": "http://svc"}});
        assert_eq!(
            run("constants.base & '/patients/' & 7", &data).unwrap(),
            json!("http://svc/patients/7")
        );
        assert_eq!(run("state.currentLookupHttpStatus >= 400", &data).unwrap(), json!(true));
        assert_eq!(run("state.absent = 1", &data).unwrap(), json!(false));
        assert!(run("constants.base < 3", &data).is_err());
    }

    #[test]
    fn logical_operators_use_truthiness() {
        let data = json!({"a": "", "b": [1], "c": 0});
        assert_eq!(run("a or b", &data).unwrap(), json!(true));
        assert_eq!(run("b and c", &data).unwrap(), json!(false));
        assert_eq!(run("$not(c) and $exists(b)", &data).unwrap(), json!(true));
    }

    #[test]
    fn join_and_count() {
        let data = json!({"tags": ["a", "b"], "one": "z"});
        assert_eq!(run("$join(tags, ',')", &data).unwrap(), json!("a,b"));
        assert_eq!(run("$count(tags)", &data).unwrap(), json!(2));
        assert_eq!(run("$count(one)", &data).unwrap(), json!(1));
        assert_eq!(run("$number('12')", &data).unwrap(), json!(12));
    }
}
