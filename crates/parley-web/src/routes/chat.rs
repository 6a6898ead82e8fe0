use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use parley_core::assistant::{ChatRequest, ConfirmRequest};
use parley_core::model::ChatTurn;
use parley_core::response::ChatResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Authenticated;
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/chat/history", get(history))
        .route("/api/v1/chat/session", delete(clear_session))
        .route("/api/v1/chat/actions/{proposal_id}/confirm", post(confirm))
        .route("/api/v1/chat/actions/{proposal_id}/cancel", post(cancel))
}

// -- Request/Response types --

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub session_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub turns: Vec<ChatTurn>,
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub session_id: String,
}

// -- Handlers --

async fn chat(
    State(state): State<Arc<AppState>>,
    Authenticated(principal): Authenticated,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let response = state.service.chat(&principal, request).await?;
    Ok(Json(response))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Authenticated(principal): Authenticated,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let turns = state
        .service
        .history(&principal, &params.session_id, params.limit)
        .await?;
    Ok(Json(HistoryResponse {
        session_id: params.session_id,
        turns,
    }))
}

async fn clear_session(
    State(state): State<Arc<AppState>>,
    Authenticated(principal): Authenticated,
    params: Result<Query<SessionParams>, QueryRejection>,
) -> Result<StatusCode, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    state
        .service
        .clear_session(&principal, &params.session_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm(
    State(state): State<Arc<AppState>>,
    Authenticated(principal): Authenticated,
    proposal_id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Path(proposal_id) = proposal_id.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let response = state
        .service
        .confirm(&principal, proposal_id, request)
        .await?;
    Ok(Json(response))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Authenticated(principal): Authenticated,
    proposal_id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Path(proposal_id) = proposal_id.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let response = state
        .service
        .cancel(&principal, proposal_id, &request.session_id)
        .await?;
    Ok(Json(response))
}
