//! Probe classification against a local HTTP server
//!
//! - 200 within the timeout is Good
//! - 500 is Bad
//! - A response slower than the timeout is Bad with latency equal to the timeout
//! - A refused connection is Bad with latency equal to the timeout

use axum::{http::StatusCode, routing::get, Router};
use pulse_agent::Prober;
use pulse_core::ProbeStatus;
use std::net::SocketAddr;
use std::time::Duration;

/// Helper to serve a small fixture app on an ephemeral port
async fn spawn_fixture_server() -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "fine" }))
        .route(
            "/fail",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "broken") }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture server");
    let addr = listener.local_addr().expect("fixture addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn test_200_is_good() {
    let addr = spawn_fixture_server().await;
    let prober = Prober::new(Duration::from_secs(2)).unwrap();

    let outcome = prober.probe(&format!("http://{}/ok", addr)).await;
    assert_eq!(outcome.status, ProbeStatus::Good);
    assert_eq!(outcome.http_status, Some(200));
    assert!(outcome.latency_ms < 2_000);
}

#[tokio::test]
async fn test_500_is_bad() {
    let addr = spawn_fixture_server().await;
    let prober = Prober::new(Duration::from_secs(2)).unwrap();

    let outcome = prober.probe(&format!("http://{}/fail", addr)).await;
    assert_eq!(outcome.status, ProbeStatus::Bad);
    assert_eq!(outcome.http_status, Some(500));
}

#[tokio::test]
async fn test_404_is_bad() {
    let addr = spawn_fixture_server().await;
    let prober = Prober::new(Duration::from_secs(2)).unwrap();

    let outcome = prober.probe(&format!("http://{}/missing", addr)).await;
    assert_eq!(outcome.status, ProbeStatus::Bad);
    assert_eq!(outcome.http_status, Some(404));
}

#[tokio::test]
async fn test_timeout_is_bad_with_ceiling_latency() {
    let addr = spawn_fixture_server().await;
    let prober = Prober::new(Duration::from_millis(300)).unwrap();

    let outcome = prober.probe(&format!("http://{}/slow", addr)).await;
    assert_eq!(outcome.status, ProbeStatus::Bad);
    assert_eq!(outcome.latency_ms, 300);
    assert_eq!(outcome.http_status, None);
}

#[tokio::test]
async fn test_refused_connection_is_bad_with_ceiling_latency() {
    // Bind then drop to obtain a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let prober = Prober::new(Duration::from_millis(500)).unwrap();
    let outcome = prober.probe(&format!("http://{}/ok", addr)).await;
    assert_eq!(outcome.status, ProbeStatus::Bad);
    assert_eq!(outcome.latency_ms, 500);
}
