//! Router-level regression tests
//!
//! These exercise the HTTP surface without a live PostgreSQL or Redis: the
//! context uses a lazy pool and a disabled bus, so only endpoints that
//! degrade gracefully (health, scheduler, stats, docs) are driven here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use enms_analytics::api::create_app;
use enms_analytics::config::AppConfig;
use enms_analytics::context::CoreContext;

fn test_ctx() -> Arc<CoreContext> {
    CoreContext::for_tests(AppConfig::default())
}

fn get(uri: &str) -> Request<Body> {
    let addr: SocketAddr = "127.0.0.1:4711".parse().unwrap();
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_degraded_without_database() {
    let app = create_app(test_ctx());
    let response = app.oneshot(get("/api/v1/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["service"], "enms-analytics");
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["dependencies"]["database"], false);
    assert_eq!(json["features"]["scheduler_enabled"], true);
    // all four jobs are described even before the scheduler runs
    assert_eq!(json["scheduler"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn rate_limit_headers_are_stamped_on_every_response() {
    let app = create_app(test_ctx());
    let response = app.oneshot(get("/api/v1/health")).await.unwrap();

    let headers = response.headers();
    // /health is a critical-class endpoint with the default budget of 100
    assert_eq!(headers["x-ratelimit-limit"], "100");
    assert!(headers.contains_key("x-ratelimit-remaining"));
    assert!(headers.contains_key("x-ratelimit-reset"));
}

#[tokio::test]
async fn scheduler_status_lists_all_jobs() {
    let app = create_app(test_ctx());
    let response = app.oneshot(get("/api/v1/scheduler/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["enabled"], true);
    let ids: Vec<&str> = json["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    for expected in [
        "baseline_retrain",
        "anomaly_detect",
        "kpi_calculate",
        "training_cleanup",
    ] {
        assert!(ids.contains(&expected), "missing job {expected}");
    }
}

#[tokio::test]
async fn trigger_unknown_job_is_404_with_detail() {
    let app = create_app(test_ctx());
    let addr: SocketAddr = "127.0.0.1:4711".parse().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/scheduler/trigger/defrag_disks")
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert!(json["detail"].as_str().unwrap().contains("defrag_disks"));
}

#[tokio::test]
async fn connection_stats_reflect_the_in_flight_request() {
    let app = create_app(test_ctx());
    let response = app.oneshot(get("/api/v1/stats/connections")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    // the request being served holds one throttle slot itself
    assert_eq!(json["open_requests"], 1);
    assert_eq!(json["max_per_ip"], 10);
    assert_eq!(json["max_total"], 100);
    assert_eq!(json["websocket_clients"], 0);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = create_app(test_ctx());
    let response = app.oneshot(get("/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["info"]["title"], "EnMS Analytics Service");
    assert!(json["paths"]["/api/v1/baseline/train"].is_object());
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = create_app(test_ctx());
    let response = app.oneshot(get("/api/v1/espresso")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn websocket_route_rejects_plain_get_for_known_topic() {
    let app = create_app(test_ctx());
    // no upgrade headers → the upgrade extractor rejects with a client error
    let response = app.oneshot(get("/ws/dashboard")).await.unwrap();
    assert!(response.status().is_client_error());
}
