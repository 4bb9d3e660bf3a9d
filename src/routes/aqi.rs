//! `GET /aqi?pollutant=&concentration=` – stateless AQI conversion.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::AppState;
use crate::error::CoreError;
use crate::models::Pollutant;

#[derive(Debug, Deserialize)]
pub struct AqiQuery {
    pollutant: String,
    concentration: f64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/aqi", get(handler))
}

async fn handler(
    State(state): State<AppState>,
    Query(params): Query<AqiQuery>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    let pollutant: Pollutant = params.pollutant.parse()?;
    let result = state.service.get_aqi(pollutant, params.concentration)?;
    Ok(Json(result))
}
