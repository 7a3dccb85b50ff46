use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use taskgate_security::{cors_layer, security_middleware, SecurityPolicy};
use tower::ServiceExt;

fn app(policy: SecurityPolicy) -> Router {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/submit", post(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(
            Arc::new(policy),
            security_middleware,
        ))
}

#[tokio::test]
async fn injects_security_headers_and_request_id() {
    let resp = app(SecurityPolicy::default())
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("strict-transport-security"));
    assert!(headers.contains_key("content-security-policy"));
    assert!(headers.contains_key("permissions-policy"));
    assert!(headers.contains_key("x-request-id"));
    assert!(!headers.contains_key("server"));
}

#[tokio::test]
async fn rejects_suspicious_query_values() {
    let resp = app(SecurityPolicy::default())
        .oneshot(
            Request::get("/ping?q=%3Cscript%3Ealert(1)%3C/script%3E")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    // Rejections still carry the header set.
    assert!(resp.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn rejects_path_traversal_in_query() {
    let resp = app(SecurityPolicy::default())
        .oneshot(
            Request::get("/ping?file=..%2F..%2Fetc%2Fpasswd")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rejects_scanner_user_agents() {
    let resp = app(SecurityPolicy::default())
        .oneshot(
            Request::get("/ping")
                .header("user-agent", "sqlmap/1.7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rejects_non_json_mutating_bodies() {
    let resp = app(SecurityPolicy::default())
        .oneshot(
            Request::post("/submit")
                .header("content-type", "text/plain")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn accepts_json_mutating_bodies() {
    let resp = app(SecurityPolicy::default())
        .oneshot(
            Request::post("/submit")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejects_oversized_declared_bodies() {
    let resp = app(SecurityPolicy::default().with_max_body_bytes(64))
        .oneshot(
            Request::post("/submit")
                .header("content-type", "application/json")
                .header("content-length", "1024")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn get_requests_need_no_content_type() {
    let resp = app(SecurityPolicy::default())
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
}

fn cors_app() -> Router {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/submit", post(|| async { "ok" }))
        .layer(cors_layer("https://tasks.example.com").unwrap())
}

#[tokio::test]
async fn cors_allows_the_configured_origin_with_credentials() {
    let resp = cors_app()
        .oneshot(
            Request::get("/ping")
                .header("origin", "https://tasks.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "https://tasks.example.com"
    );
    assert_eq!(headers["access-control-allow-credentials"], "true");
}

#[tokio::test]
async fn cors_preflight_covers_the_token_exchange_post() {
    let resp = cors_app()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/submit")
                .header("origin", "https://tasks.example.com")
                .header("access-control-request-method", "POST")
                .header("access-control-request-headers", "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "https://tasks.example.com"
    );
    assert!(headers["access-control-allow-methods"]
        .to_str()
        .unwrap()
        .contains("POST"));
    assert!(headers["access-control-allow-headers"]
        .to_str()
        .unwrap()
        .to_ascii_lowercase()
        .contains("content-type"));
}

#[tokio::test]
async fn cors_ignores_other_origins() {
    let resp = cors_app()
        .oneshot(
            Request::get("/ping")
                .header("origin", "https://evil.example.net")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(!resp
        .headers()
        .contains_key("access-control-allow-origin"));
}
