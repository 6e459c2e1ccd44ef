//! Admin API tests driven through the router without a socket.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use service_resilience::admin::{self, AdminState};
use service_resilience::config::ResilienceConfig;
use service_resilience::discovery::InstanceStatus;
use service_resilience::lifecycle::ResilienceContext;
use service_resilience::resilience::ExecuteOptions;

const KEY: &str = "test-admin-key";

fn context() -> ResilienceContext {
    let mut config = ResilienceConfig::default();
    config.admin.api_key = KEY.to_string();
    config.health_check.enabled = false;
    config.health_monitor.enabled = false;
    ResilienceContext::from_config(config).unwrap()
}

fn app(ctx: &ResilienceContext) -> Router {
    admin::router(AdminState::from_context(ctx))
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", KEY));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_requests_without_key_are_rejected() {
    let ctx = context();
    let app = app(&ctx);

    let res = app
        .clone()
        .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .oneshot(
            Request::get("/admin/status")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_register_discover_and_deregister() {
    let ctx = context();
    let app = app(&ctx);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/admin/services/orders/instances",
            Some(json!({ "id": "orders-1", "host": "10.0.0.1", "port": 8080, "tags": ["blue"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "orders-1");
    assert_eq!(body["created"], true);

    // Same id again replaces the entry
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/admin/services/orders/instances",
            Some(json!({ "id": "orders-1", "host": "10.0.0.1", "port": 8081 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], false);

    let (status, body) = send(&app, request(Method::GET, "/admin/services/orders", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "orders");
    assert_eq!(body["strategy"], "round_robin");
    assert_eq!(body["healthy"], 1);
    assert_eq!(body["instances"][0]["port"], 8081);

    let (status, body) = send(&app, request(Method::GET, "/admin/status", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["services"], 1);
    assert_eq!(body["instances"], 1);
    assert_eq!(body["healthy_instances"], 1);

    let (status, _) = send(&app, request(Method::DELETE, "/admin/instances/orders-1", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, request(Method::DELETE, "/admin/instances/orders-1", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("orders-1"));

    assert!(ctx.discovery().discover_all("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_registration_is_bad_request() {
    let ctx = context();
    let app = app(&ctx);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/admin/services/orders/instances",
            Some(json!({ "id": "orders-1", "host": "", "port": 8080 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_status_update_takes_instance_out_of_rotation() {
    let ctx = context();
    let app = app(&ctx);

    send(
        &app,
        request(
            Method::POST,
            "/admin/services/orders/instances",
            Some(json!({ "id": "orders-1", "host": "10.0.0.1", "port": 8080 })),
        ),
    )
    .await;

    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            "/admin/instances/orders-1/status",
            Some(json!({ "status": "stopping", "metadata": { "reason": "drain" } })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let instance = &ctx.discovery().discover_all("orders").await.unwrap()[0];
    assert_eq!(instance.status, InstanceStatus::Stopping);
    assert_eq!(instance.metadata["reason"], "drain");
    assert!(ctx.discovery().discover_one("orders").await.unwrap().is_none());

    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            "/admin/instances/missing/status",
            Some(json!({ "status": "healthy" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failures_listing_and_resolution() {
    let ctx = context();
    let app = app(&ctx);
    let manager = ctx.fault_tolerance();
    manager.configure_service("search", []);

    for message in ["connection refused", "request timed out"] {
        let _ = manager
            .execute("search", ExecuteOptions::new(), || async move {
                Err::<(), _>(message.to_string())
            })
            .await;
    }

    let (status, body) = send(&app, request(Method::GET, "/admin/failures?service=search", None)).await;
    assert_eq!(status, StatusCode::OK);
    let failures = body.as_array().unwrap();
    assert_eq!(failures.len(), 2);
    // Newest first
    assert_eq!(failures[0]["failure_type"], "timeout");
    assert_eq!(failures[1]["failure_type"], "connection");

    let id = failures[1]["id"].as_str().unwrap().to_string();
    let (status, body) = send(
        &app,
        request(Method::POST, &format!("/admin/failures/{}/resolve", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolved"], true);

    // Second resolution is a miss
    let (status, _) = send(
        &app,
        request(Method::POST, &format!("/admin/failures/{}/resolve", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, request(Method::GET, "/admin/failures?resolved=false", None)).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, request(Method::GET, "/admin/resilience", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests"]["search"]["total"], 2);
    assert_eq!(body["requests"]["search"]["failure"], 2);
    assert_eq!(body["failures"]["service_statistics"]["search"]["resolved"], 1);
    assert_eq!(body["circuit_breakers"]["search"]["state"], "closed");
}
