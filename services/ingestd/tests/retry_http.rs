//! Transport + retry executor against a live in-process server:
//! transient 5xx recovery, fatal 4xx, and content-type based decoding.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use ingest_core::retry::RetryPolicy;
use ingestd::http::{HttpClient, ResponseBody};
use ingestd::retry::with_retry;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Clone, Default)]
struct Flaky {
    calls: Arc<AtomicUsize>,
}

async fn flaky(State(state): State<Flaky>) -> impl IntoResponse {
    if state.calls.fetch_add(1, Ordering::SeqCst) < 2 {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
    } else {
        Json(json!({"ok": true})).into_response()
    }
}

async fn missing() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "gone")
}

async fn plain() -> impl IntoResponse {
    "just text"
}

async fn start_server(state: Flaky) -> SocketAddr {
    let router = Router::new()
        .route("/flaky", get(flaky))
        .route("/missing", get(missing))
        .route("/plain", get(plain))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serves");
    });
    addr
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 1,
        max_delay_ms: 10,
    }
}

#[tokio::test]
async fn transient_5xx_recovers() {
    let state = Flaky::default();
    let addr = start_server(state.clone()).await;
    let client = HttpClient::new(Duration::from_secs(5), 2).expect("client");

    let url = format!("http://{addr}/flaky");
    let response = with_retry(quick_policy(), "flaky", || client.get(&url, &[]))
        .await
        .expect("eventual success");

    assert_eq!(response.status, 200);
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
    let body = response.body.as_json().expect("json body");
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn fatal_4xx_does_not_retry() {
    let state = Flaky::default();
    let addr = start_server(state).await;
    let client = HttpClient::new(Duration::from_secs(5), 2).expect("client");

    let url = format!("http://{addr}/missing");
    let err = with_retry(quick_policy(), "missing", || client.get(&url, &[]))
        .await
        .expect_err("404 is fatal");

    assert_eq!(err.status, 404);
    assert_eq!(err.method, "GET");
    assert!(err.detail.contains("gone"));
}

#[tokio::test]
async fn non_json_bodies_decode_as_text() {
    let state = Flaky::default();
    let addr = start_server(state).await;
    let client = HttpClient::new(Duration::from_secs(5), 2).expect("client");

    let url = format!("http://{addr}/plain");
    let response = client.get(&url, &[]).await.expect("response");
    match response.body {
        ResponseBody::Text(text) => assert_eq!(text, "just text"),
        ResponseBody::Json(_) => panic!("expected text body"),
    }
}

#[tokio::test]
async fn connection_refused_is_a_transport_error() {
    let client = HttpClient::new(Duration::from_millis(500), 2).expect("client");
    // Port 9 on localhost: nothing listens there.
    let err = client
        .get("http://127.0.0.1:9/events", &[])
        .await
        .expect_err("refused");
    assert_eq!(err.status, 0);
}
