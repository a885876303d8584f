mod common;

use admission_gate::api::{create_api_router, DecideResponse};
use admission_gate::config::GateConfig;
use admission_gate::model::Verdict;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use common::{engine, ALICE};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn router() -> Router {
    create_api_router(engine(GateConfig::default()).await)
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn health_is_ok() {
    let app = router().await;
    let (status, _) = send(&app, empty_request(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn registered_identity_is_admitted() {
    let app = router().await;
    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/v1/identities",
            json!({ "identity": "+15550142", "tier": "elevated", "user_id": "u-42" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/v1/decide", json!({ "identity": "+15550142" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let decision: DecideResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(decision.verdict, Verdict::Allow);
    assert_eq!(decision.reason, None);
    assert_eq!(decision.context["tier"], "elevated");
    assert_eq!(decision.context["user_id"], "u-42");
}

#[tokio::test]
async fn unknown_identity_is_unauthorized() {
    let app = router().await;
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/v1/decide", json!({ "identity": "+15550199" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let decision: DecideResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(decision.verdict, Verdict::Deny);
    assert_eq!(decision.reason.as_deref(), Some("unauthorized"));
}

#[tokio::test]
async fn empty_identity_is_rejected() {
    let app = router().await;
    let (status, _) = send(
        &app,
        json_request(Method::POST, "/v1/decide", json!({ "identity": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blocklist_lifecycle() {
    let app = router().await;
    let uri = format!("/v1/blocklist/{ALICE}");

    let (status, _) = send(&app, empty_request(Method::GET, &uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/v1/blocklist",
            json!({ "identity": ALICE, "reason": "manual" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let entry: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(entry["reason"], "manual");

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/v1/decide", json!({ "identity": ALICE })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let decision: DecideResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(decision.reason.as_deref(), Some("manual"));

    let (status, _) = send(&app, empty_request(Method::GET, &uri)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, empty_request(Method::DELETE, &uri)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, empty_request(Method::DELETE, &uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn block_in_the_past_is_rejected() {
    let app = router().await;
    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/v1/blocklist",
            json!({
                "identity": ALICE,
                "reason": "abuse",
                "expires_at": Utc::now() - ChronoDuration::hours(1),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn observed_spend_moves_the_budget_state() {
    let app = router().await;
    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/v1/budget/observe",
            json!({ "period_id": "2026-10", "spend_delta": 850.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let state: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["state"], "warning");
    assert_eq!(state["period_estimated_spend"], 850.0);

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/v1/budget/observe",
            json!({ "period_id": "2026-10", "spend_delta": "lots" }),
        ),
    )
    .await;
    assert!(status.is_client_error());

    let (status, body) = send(&app, empty_request(Method::GET, "/v1/budget")).await;
    assert_eq!(status, StatusCode::OK);
    let current: Value = serde_json::from_slice(&body).unwrap();
    assert!(current["state"].is_string());
}

#[tokio::test]
async fn metrics_export_decision_counters() {
    let app = router().await;
    send(
        &app,
        json_request(Method::POST, "/v1/decide", json!({ "identity": ALICE })),
    )
    .await;

    let (status, body) = send(&app, empty_request(Method::GET, "/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("gate_decisions_total"));
}
