//! `ReqwestHttpClient` against a local mock server.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use mediator_core::http::{HttpClient, HttpError, HttpRequest};
use mediator_core::request::Method;
use mediator_http::ReqwestHttpClient;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(method: Method, url: String) -> HttpRequest {
    HttpRequest {
        method,
        url,
        headers: BTreeMap::new(),
        query: BTreeMap::new(),
        body: None,
    }
}

#[tokio::test]
async fn sends_headers_query_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/patients"))
        .and(header("x-openhim-transactionid", "tx-1"))
        .and(query_param("system", "mpi"))
        .and(body_json(json!({"name": "Ada"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ReqwestHttpClient::builder().build().unwrap();
    let mut call = request(Method::Post, format!("{}/patients", server.uri()));
    call.headers.insert("x-openhim-transactionid".to_string(), "tx-1".to_string());
    call.query.insert("system".to_string(), "mpi".to_string());
    call.body = Some(json!({"name": "Ada"}));

    let response = client.send(call).await.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.body, json!({"id": 7}));
    assert!(response.headers.contains_key("content-type"));
}

#[tokio::test]
async fn error_statuses_are_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let client = ReqwestHttpClient::builder().build().unwrap();
    let response = client.send(request(Method::Get, server.uri())).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.body, json!("unavailable"));
}

#[tokio::test]
async fn timeout_is_no_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = ReqwestHttpClient::builder()
        .timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let err = client.send(request(Method::Get, server.uri())).await.unwrap_err();
    assert!(matches!(err, HttpError::NoResponse { .. }));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
        .mount(&server)
        .await;

    let client = ReqwestHttpClient::builder().max_response_bytes(16).build().unwrap();
    let err = client.send(request(Method::Get, server.uri())).await.unwrap_err();
    assert!(err.message().contains("too large"));
}

#[tokio::test]
async fn malformed_url_is_a_setup_failure() {
    let client = ReqwestHttpClient::builder().build().unwrap();
    let err = client
        .send(request(Method::Get, "not a url".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Setup { .. }));
}
