use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Extension, Router};
use tower::ServiceExt;
use vexe_common::internal_auth::{CallerService, InternalAuthLayer};
use vexe_common::request_id::RequestIdLayer;
use vexe_common::security_headers::SecurityHeadersLayer;

#[tokio::test]
async fn internal_auth_not_required_allows_request() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(InternalAuthLayer::new(false, None));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn internal_auth_required_without_secret_is_503() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(InternalAuthLayer::new(true, None));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn internal_auth_missing_or_wrong_secret_is_401() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(InternalAuthLayer::new(true, Some("secret".to_string())));

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header("x-vexe-internal-secret", "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn internal_auth_correct_secret_passes_and_exposes_caller() {
    async fn who(caller: Option<Extension<CallerService>>) -> String {
        caller.map(|Extension(c)| c.0).unwrap_or_default()
    }

    let app = Router::new().route("/x", get(who)).layer(
        InternalAuthLayer::new(true, Some("secret".to_string()))
            .with_allowed_callers(vec!["bff".to_string()]),
    );

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header("x-vexe-internal-secret", "secret")
                .header("x-vexe-caller", "BFF")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"bff");
}

#[tokio::test]
async fn internal_auth_caller_allowlist_enforced() {
    let app = Router::new().route("/x", get(|| async { "ok" })).layer(
        InternalAuthLayer::new(true, Some("secret".to_string()))
            .with_allowed_callers(vec!["bff".to_string()]),
    );

    // Missing caller id.
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/x")
                .header("x-vexe-internal-secret", "secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Caller not on the allowlist.
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header("x-vexe-internal-secret", "secret")
                .header("x-vexe-caller", "ops-console")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn request_id_minted_when_missing() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(RequestIdLayer::new());

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let rid = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!(rid.len(), 32);
    assert!(rid.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn request_id_reuses_sane_inbound_value() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(RequestIdLayer::new());

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header("x-request-id", "bff-7f3a.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let rid = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!(rid, "bff-7f3a.1");
}

#[tokio::test]
async fn request_id_replaces_garbage_inbound_value() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(RequestIdLayer::new());

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header("x-request-id", "bad id with spaces")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let rid = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!(rid.len(), 32);
}

#[tokio::test]
async fn security_headers_present_on_responses() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(SecurityHeadersLayer::new(false));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(
        resp.headers()
            .get("x-content-type-options")
            .and_then(|v| v.to_str().ok()),
        Some("nosniff")
    );
    assert_eq!(
        resp.headers()
            .get("x-frame-options")
            .and_then(|v| v.to_str().ok()),
        Some("DENY")
    );
}
