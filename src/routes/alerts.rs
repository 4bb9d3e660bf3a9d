//! Alert rule endpoints.
//!
//! - `GET /alerts?user_id=` – a user's rules, newest first
//! - `POST /alerts` – create a rule from its wire form
//! - `PUT /alerts/{id}` – replace a rule (owner taken from the body)
//! - `DELETE /alerts/{id}?user_id=` – delete one of the user's rules
//! - `PUT /alerts/{id}/active` – enable or disable a rule
//! - `POST /alerts/evaluate` – dry-run the matcher for one reading

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::CoreError;
use crate::models::{AlertRuleDraft, RawReading};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/alerts", get(list).post(create))
        .route("/alerts/evaluate", post(evaluate))
        .route("/alerts/{id}", put(update).delete(remove))
        .route("/alerts/{id}/active", put(set_active))
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    user_id: i64,
}

async fn list(
    State(state): State<AppState>,
    Query(owner): Query<OwnerQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let rules = state.service.list_rules(owner.user_id).await?;
    Ok(Json(rules))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<AlertRuleDraft>,
) -> Result<impl IntoResponse, CoreError> {
    let rule = state.service.update_rule(id, draft).await?;
    Ok(Json(rule))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> Result<impl IntoResponse, CoreError> {
    state.service.delete_rule(id, owner.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create(
    State(state): State<AppState>,
    Json(draft): Json<AlertRuleDraft>,
) -> Result<impl IntoResponse, CoreError> {
    let rule = state.service.create_rule(draft).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[derive(Debug, Deserialize)]
pub struct ActiveBody {
    is_active: bool,
}

#[derive(Debug, Serialize)]
struct ActiveResponse {
    id: i64,
    is_active: bool,
}

async fn set_active(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ActiveBody>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    state.service.set_rule_active(id, body.is_active).await?;
    Ok(Json(ActiveResponse {
        id,
        is_active: body.is_active,
    }))
}

/// Body of `POST /alerts/evaluate`. `sensor_id` defaults to the reading's.
#[derive(Debug, Deserialize)]
pub struct EvaluateBody {
    reading: RawReading,
    sensor_id: Option<String>,
}

async fn evaluate(
    State(state): State<AppState>,
    Json(body): Json<EvaluateBody>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    let reading = body.reading.into_reading()?;
    let sensor_id = body.sensor_id.unwrap_or_else(|| reading.sensor_id.clone());
    let sensor = state.service.resolve_sensor(&sensor_id).await?;
    let results = state.service.evaluate_alerts(&reading, &sensor).await?;
    Ok(Json(results))
}
