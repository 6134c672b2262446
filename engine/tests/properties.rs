//! Property tests for fan-out ordering, concurrency bounds and merge policy.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use mediator_core::request::Method;
use mediator_core::transaction::InboundRequest;
use mediator_core::{PhaseRequests, TransactionState};
use mediator_engine::{Engine, EngineConfig};
use mediator_expression::CachedEvaluator;
use mediator_testing::properties::{item_delays, status_code};
use mediator_testing::{MockHttpClient, MockReply, test_clock, test_epoch};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::block_on;

fn engine(http: &MockHttpClient) -> Engine {
    Engine::builder(EngineConfig::default())
        .http_client(Arc::new(http.clone()))
        .evaluator(Arc::new(CachedEvaluator::new()))
        .clock(Arc::new(test_clock()))
        .build()
        .unwrap()
}

fn transaction(body: Value) -> TransactionState {
    TransactionState::new("props", InboundRequest::new(Method::Post).with_body(body), test_epoch())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn fan_out_results_follow_item_order(delays in item_delays(8), limit in 1usize..4) {
        let replies = delays.clone();
        let http = MockHttpClient::new().handler(move |request| {
            let index: usize = request.url.rsplit('/').next()?.parse().ok()?;
            Some(MockReply::json(200, json!(index)).with_delay(replies[index]))
        });
        let requests = PhaseRequests::from_json(&json!({
            "lookup": [{
                "id": "items",
                "forEach": {"items": "payload.list", "concurrency": limit},
                "config": {"method": "get", "url": "http://svc/items/:item",
                           "params": {"url": {"item": {"path": "item"}}}}
            }]
        }))
        .unwrap();
        let items: Vec<usize> = (0..delays.len()).collect();
        let mut tx = transaction(json!({"list": items.clone()}));

        block_on(engine(&http).run_lookup_phase(&mut tx, &requests.lookup)).unwrap();

        let data: Vec<Value> = tx.lookup_requests["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["data"].clone())
            .collect();
        let expected: Vec<Value> = items.iter().map(|i| json!(i)).collect();
        prop_assert_eq!(data, expected);
        prop_assert!(http.max_in_flight() <= limit);
        if delays.iter().all(|delay| !delay.is_zero()) {
            // Every call is still sleeping when the next permit is handed out.
            prop_assert_eq!(http.max_in_flight(), limit.min(delays.len()));
        }
        prop_assert_eq!(http.requests().len(), delays.len());
    }

    #[test]
    fn lookup_status_is_the_maximum_observed(
        statuses in proptest::collection::vec(status_code(), 1..5),
    ) {
        let mut http = MockHttpClient::new();
        let mut specs = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let url = format!("http://svc/{i}");
            http = http.route(
                url.clone(),
                MockReply::json(*status, json!({})).with_delay(Duration::from_millis((i as u64 * 7) % 11)),
            );
            specs.push(json!({
                "id": format!("s{i}"),
                "allowedStatuses": ["2xx", "4xx", "5xx"],
                "config": {"method": "get", "url": url}
            }));
        }
        let requests = PhaseRequests::from_json(&json!({"lookup": specs})).unwrap();
        let mut tx = transaction(json!({}));

        block_on(engine(&http).run_lookup_phase(&mut tx, &requests.lookup)).unwrap();

        prop_assert_eq!(tx.state.current_lookup_http_status, statuses.iter().max().copied());
        prop_assert_eq!(tx.lookup_requests.len(), statuses.len());
    }

    #[test]
    fn primary_outcome_is_never_overwritten(
        primary in status_code(),
        secondary in status_code(),
        secondary_delay in 0u64..15,
        primary_delay in 0u64..15,
    ) {
        let http = MockHttpClient::new()
            .route(
                "http://svc/primary",
                MockReply::json(primary, json!({"from": "primary"}))
                    .with_delay(Duration::from_millis(primary_delay)),
            )
            .route(
                "http://svc/secondary",
                MockReply::json(secondary, json!({"from": "secondary"}))
                    .with_delay(Duration::from_millis(secondary_delay)),
            );
        let requests = PhaseRequests::from_json(&json!({
            "response": [
                {"id": "secondary", "config": {"method": "post", "url": "http://svc/secondary"}},
                {"id": "primary", "primary": true, "config": {"method": "post", "url": "http://svc/primary"}}
            ]
        }))
        .unwrap();
        let mut tx = transaction(json!({}));
        tx.response.status = 200;
        tx.response.body = json!({"mapped": true});

        block_on(engine(&http).run_response_phase(&mut tx, &requests.response)).unwrap();

        prop_assert!(tx.has_primary_request);
        prop_assert_eq!(tx.response.status, primary);
        prop_assert_eq!(&tx.response.body, &json!({"from": "primary"}));
        prop_assert_eq!(tx.router_response_statuses.len(), 2);
    }
}
