//! Notification history, the manual test trigger and the read flag.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::error::CoreError;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/notifications", get(history).post(send_manual))
        .route("/notifications/{id}/read", put(mark_read))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    user_id: i64,
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let notifications = state.service.notification_history(params.user_id, params.limit).await?;
    Ok(Json(notifications))
}

#[derive(Debug, Deserialize)]
pub struct ManualBody {
    user_id: i64,
    title: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    channels: Vec<String>,
}

async fn send_manual(
    State(state): State<AppState>,
    Json(body): Json<ManualBody>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    let notification = state
        .service
        .send_manual_notification(body.user_id, &body.title, &body.message, &body.channels)
        .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

#[derive(Debug, Deserialize)]
pub struct ReadBody {
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    id: Uuid,
    read: bool,
}

async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReadBody>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    state.service.mark_notification_read(id, body.user_id).await?;
    Ok(Json(ReadResponse { id, read: true }))
}
