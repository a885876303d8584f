// Gateway HTTP API implementation
// This file provides the decision endpoint, the operator blocklist and
// allow-list endpoints, the cost-observation endpoint and metrics export
//
// Numan Thabit 2025 Nov

use crate::engine::AdmissionEngine;
use crate::errors::GateError;
use crate::model::{
    AdmissionDecision, AuthorizationStatus, BlockEntry, BlockReason, BudgetState, DecisionContext,
    Identity, RequestClass, RequestMetadata, Tier, Verdict,
};
use crate::window::{budget_period_id, WindowKind};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router as AxumRouter,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub identity: String,
    #[serde(default)]
    pub request_class: RequestClass,
    pub timestamp: Option<DateTime<Utc>>,
    pub channel: Option<String>,
    pub suspicion: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecideResponse {
    pub verdict: Verdict,
    pub reason: Option<String>,
    pub window_kind: Option<WindowKind>,
    pub identity: String,
    pub context: DecisionContext,
}

impl From<AdmissionDecision> for DecideResponse {
    fn from(decision: AdmissionDecision) -> Self {
        Self {
            verdict: decision.verdict,
            reason: decision.reason.map(|reason| reason.code().to_string()),
            window_kind: decision.reason.and_then(|reason| reason.window_kind()),
            identity: decision.identity,
            context: decision.context,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ObserveRequest {
    pub period_id: Option<String>,
    pub spend_delta: f64,
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub identity: String,
    pub reason: BlockReason,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterIdentityRequest {
    pub identity: String,
    #[serde(default = "default_status")]
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub tier: Tier,
    pub user_id: Option<String>,
}

fn default_status() -> AuthorizationStatus {
    AuthorizationStatus::Active
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: GateError) -> ApiError {
    let status = match err {
        GateError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GateError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GateError::InvalidInput(_) => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Create the HTTP router with API endpoints
pub fn create_api_router(engine: Arc<AdmissionEngine>) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/v1/decide", post(decide))
        .route("/v1/budget", get(budget_state))
        .route("/v1/budget/observe", post(observe_spend))
        .route("/v1/blocklist", post(add_block))
        .route(
            "/v1/blocklist/:identity",
            get(get_block).delete(remove_block),
        )
        .route("/v1/identities", post(register_identity))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Health check endpoint
async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn metrics() -> String {
    crate::metrics::render()
}

/// Inbound decision call. A missing timestamp means "now".
async fn decide(
    State(engine): State<Arc<AdmissionEngine>>,
    Json(req): Json<DecideRequest>,
) -> Result<Json<DecideResponse>, ApiError> {
    if req.identity.trim().is_empty() {
        return Err(api_error(GateError::InvalidInput(
            "identity must not be empty".to_string(),
        )));
    }
    let mut request = RequestMetadata::new(req.request_class, req.timestamp.unwrap_or_else(Utc::now));
    request.channel = req.channel;
    request.suspicion = req.suspicion;

    let decision = engine.decide(&req.identity, &request).await;
    Ok(Json(decision.into()))
}

async fn budget_state(State(engine): State<Arc<AdmissionEngine>>) -> Json<BudgetState> {
    let period_id = budget_period_id(Utc::now());
    Json(engine.budget().current_state(&period_id).await)
}

/// Cost-observation interface
async fn observe_spend(
    State(engine): State<Arc<AdmissionEngine>>,
    Json(req): Json<ObserveRequest>,
) -> Result<Json<BudgetState>, ApiError> {
    let period_id = req
        .period_id
        .unwrap_or_else(|| budget_period_id(Utc::now()));
    let state = engine
        .budget()
        .observe(&period_id, req.spend_delta)
        .await
        .map_err(api_error)?;
    Ok(Json(state))
}

async fn add_block(
    State(engine): State<Arc<AdmissionEngine>>,
    Json(req): Json<BlockRequest>,
) -> Result<(StatusCode, Json<BlockEntry>), ApiError> {
    let now = Utc::now();
    if req.expires_at.is_some_and(|expiry| expiry <= now) {
        return Err(api_error(GateError::InvalidInput(
            "expires_at must be in the future".to_string(),
        )));
    }
    let entry = engine
        .blocklist()
        .block(&req.identity, req.reason, req.expires_at, now)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_block(
    State(engine): State<Arc<AdmissionEngine>>,
    Path(identity): Path<String>,
) -> Result<Json<BlockEntry>, ApiError> {
    match engine
        .blocklist()
        .active_block(&identity, Utc::now())
        .await
        .map_err(api_error)?
    {
        Some(entry) => Ok(Json(entry)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("{identity} is not blocked"),
            }),
        )),
    }
}

async fn remove_block(
    State(engine): State<Arc<AdmissionEngine>>,
    Path(identity): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = engine.blocklist().unblock(&identity).await.map_err(api_error)?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

/// Out-of-band allow-listing
async fn register_identity(
    State(engine): State<Arc<AdmissionEngine>>,
    Json(req): Json<RegisterIdentityRequest>,
) -> Result<StatusCode, ApiError> {
    if req.identity.trim().is_empty() {
        return Err(api_error(GateError::InvalidInput(
            "identity must not be empty".to_string(),
        )));
    }
    engine
        .register_identity(Identity {
            subject: req.identity,
            authorization_status: req.status,
            tier: req.tier,
            user_id: req.user_id,
        })
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
