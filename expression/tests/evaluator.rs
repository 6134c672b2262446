//! Evaluator behaviour as seen through the `ExpressionEvaluator` boundary.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use mediator_core::expression::{ExpressionError, ExpressionEvaluator};
use mediator_expression::{CachedEvaluator, GlobalEvaluator};
use proptest::prelude::*;
use serde_json::{Value, json};

#[test]
fn urls_and_static_header_values_do_not_compile() {
    let evaluator = CachedEvaluator::new();
    for text in ["http://registry:8080/patients", "application/json", "Bearer abc"] {
        let err = evaluator.execute("k", text, &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }), "{text} should not compile");
        assert!(!evaluator.soft_evaluate("k", text, &json!({})).ok);
    }
}

#[test]
fn soft_evaluate_reports_evaluation_failure() {
    let evaluator = CachedEvaluator::new();
    let data = json!({"payload": {"name": 42}});
    let result = evaluator.soft_evaluate("h", "$uppercase(payload.name)", &data);
    assert!(!result.ok);
    assert!(result.usable().is_none());
    assert!(evaluator.exists("h"));
}

#[test]
fn global_evaluator_shares_compiled_forms() {
    let key = "global-test#lookup-a#condition";
    let data = json!({"query": {"force": "yes"}});
    assert_eq!(GlobalEvaluator.execute(key, "$exists(query.force)", &data).unwrap(), json!(true));
    assert!(CachedEvaluator::global().exists(key));
}

#[tokio::test]
async fn concurrent_transactions_share_one_cache() {
    let evaluator = std::sync::Arc::new(CachedEvaluator::new());
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let evaluator = std::sync::Arc::clone(&evaluator);
            tokio::spawn(async move {
                let data = json!({"payload": {"n": i}});
                evaluator.execute("shared", "payload.n", &data).unwrap()
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), json!(i));
    }
    assert_eq!(evaluator.cache().len(), 1);
}

proptest! {
    #[test]
    fn indexing_matches_vec_indexing(items in proptest::collection::vec(0i64..1000, 1..20), index in 0usize..25) {
        let evaluator = CachedEvaluator::new();
        let data = json!({"payload": {"items": items}});
        let value = evaluator.execute("idx", &format!("payload.items[{index}]"), &data).unwrap();
        let expected = items.get(index).map_or(Value::Null, |n| json!(n));
        prop_assert_eq!(value, expected);
    }
}
