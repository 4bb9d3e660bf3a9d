//! Sensor fleet management.
//!
//! - `GET /sensors` – every registered sensor
//! - `POST /sensors` – register a sensor
//! - `GET /sensors/status` – sensors with today's reading counts
//! - `GET|PUT|DELETE /sensors/{id}` – one sensor

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::debug;

use super::AppState;
use crate::error::CoreError;
use crate::models::SensorDraft;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sensors", get(list).post(register))
        .route("/sensors/status", get(overview))
        .route("/sensors/{id}", get(fetch).put(update).delete(remove))
}

async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, CoreError> {
    let sensors = state.service.list_sensors().await?;
    Ok(Json(sensors))
}

async fn register(
    State(state): State<AppState>,
    Json(draft): Json<SensorDraft>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    debug!("POST /sensors - {}", draft.id);
    let sensor = state.service.register_sensor(draft).await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn overview(State(state): State<AppState>) -> Result<impl IntoResponse, CoreError> {
    let sensors = state.service.sensor_overview().await?;
    Ok(Json(sensors))
}

async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let sensor = state.service.get_sensor(&id).await?;
    Ok(Json(sensor))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(draft): Json<SensorDraft>,
) -> Result<impl IntoResponse, CoreError> {
    let sensor = state.service.update_sensor(&id, draft).await?;
    Ok(Json(sensor))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    state.service.delete_sensor(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
