//! `GET /compliance?days=` – standards summary over a trailing window.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::AppState;
use crate::error::CoreError;

#[derive(Debug, Deserialize)]
pub struct ComplianceQuery {
    days: Option<u32>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/compliance", get(handler))
}

async fn handler(
    State(state): State<AppState>,
    Query(params): Query<ComplianceQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let report = state.service.compliance(params.days.unwrap_or(30)).await?;
    Ok(Json(report))
}
