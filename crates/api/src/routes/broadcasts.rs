//! Broadcast creation and control routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Broadcast, DeliveryStatus};
use herald_engine::broadcast::{
    CancelSummary, CreateBroadcastParams, RecipientPage, RetrySummary, ScheduleNotificationParams,
};
use herald_engine::progress::Progress;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/broadcasts", post(create_broadcast))
        .route("/api/notifications", post(schedule_notification))
        .route("/api/broadcasts/{id}", get(get_broadcast))
        .route("/api/broadcasts/{id}/progress", get(get_progress))
        .route("/api/broadcasts/{id}/cancel", post(cancel_broadcast))
        .route("/api/broadcasts/{id}/retry", post(retry_failed))
        .route("/api/broadcasts/{id}/recipients", get(list_recipients))
}

#[derive(Debug, Deserialize)]
pub struct RecipientQuery {
    pub status: Option<DeliveryStatus>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// POST /api/broadcasts: store a draft; delivery happens on a later scheduler tick.
async fn create_broadcast(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateBroadcastParams>,
) -> Result<Json<Broadcast>, AppError> {
    let broadcast = state.broadcasts.create(auth.user_id, params).await?;
    Ok(Json(broadcast))
}

/// POST /api/notifications
async fn schedule_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<ScheduleNotificationParams>,
) -> Result<Json<Broadcast>, AppError> {
    let broadcast = state
        .broadcasts
        .schedule_notification(auth.user_id, params)
        .await?;
    Ok(Json(broadcast))
}

async fn get_broadcast(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Broadcast>, AppError> {
    Ok(Json(state.broadcasts.get(id).await?))
}

async fn get_progress(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Progress>, AppError> {
    Ok(Json(state.broadcasts.get_progress(id).await?))
}

/// POST /api/broadcasts/{id}/cancel: 409 once the broadcast is terminal.
async fn cancel_broadcast(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelSummary>, AppError> {
    let summary = state.broadcasts.cancel(id).await?;
    tracing::info!(
        broadcast_id = %id,
        user_id = %auth.user_id,
        auth_method = auth.method.as_str(),
        "Cancel requested via API"
    );
    Ok(Json(summary))
}

/// POST /api/broadcasts/{id}/retry: only for completed or failed broadcasts.
async fn retry_failed(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<RetrySummary>, AppError> {
    let summary = state.broadcasts.retry_failed(id).await?;
    tracing::info!(
        broadcast_id = %id,
        user_id = %auth.user_id,
        auth_method = auth.method.as_str(),
        "Retry requested via API"
    );
    Ok(Json(summary))
}

async fn list_recipients(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
    Query(query): Query<RecipientQuery>,
) -> Result<Json<RecipientPage>, AppError> {
    let page = state
        .broadcasts
        .list_recipients(id, query.status, query.page, query.per_page)
        .await?;
    Ok(Json(page))
}
