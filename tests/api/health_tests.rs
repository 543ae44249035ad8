//! Health Check API Tests

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::Value;

use crate::common::TestApp;

/// Test basic health check endpoint returns 200 OK with a status field
#[tokio::test]
async fn test_health_check_returns_ok() {
    let app = TestApp::new().await;

    let response = app.server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
}

/// Liveness does not depend on the database or broker
#[tokio::test]
async fn test_liveness_probe() {
    let app = TestApp::new().await;

    let response = app.server.get("/health/live").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "alive");
}

/// Readiness reports 503 while the database is unreachable
#[tokio::test]
async fn test_readiness_fails_without_database() {
    let app = TestApp::new().await;

    let response = app.server.get("/health/ready").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "unhealthy");
    assert_eq!(body["checks"]["broker"]["status"], "healthy");
    assert_eq!(body["checks"]["realtime"]["active_rooms"], 0);
}

/// A broker outage is reported alongside the database
#[tokio::test]
async fn test_readiness_reports_broker_outage() {
    let app = TestApp::new().await;
    app.broker.set_available(false);

    let response = app.server.get("/health/ready").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["checks"]["broker"]["status"], "unhealthy");
}

/// Prometheus exposition includes the room metrics
#[tokio::test]
async fn test_metrics_endpoint_exports_room_metrics() {
    let app = TestApp::new().await;

    let response = app.server.get("/metrics").await;

    response.assert_status_ok();
    assert!(response.text().contains("support_chat_rooms_active"));
}
