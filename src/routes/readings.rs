//! Reading ingestion and history endpoints.
//!
//! - `POST /readings` – submit one raw reading to the pipeline
//! - `GET /readings/latest` – newest reading of every sensor
//! - `GET /readings/historical` – raw readings, newest first
//! - `GET /readings/aggregate` – hour/day/month rollups

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::AppState;
use crate::aggregate::{AggregateFilter, Granularity};
use crate::error::CoreError;
use crate::models::{Pollutant, RawReading};
use crate::service::HistoryWindow;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/readings", post(submit))
        .route("/readings/latest", get(latest))
        .route("/readings/historical", get(historical))
        .route("/readings/aggregate", get(aggregate))
}

async fn submit(
    State(state): State<AppState>,
    Json(raw): Json<RawReading>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    debug!("POST /readings - sensor {}", raw.sensor_id);
    let outcome = state.service.submit_reading(raw).await?;
    info!(
        "POST /readings - {} notifications, {} suppressed",
        outcome.notifications.len(),
        outcome.suppressed.len()
    );
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn latest(State(state): State<AppState>) -> Result<impl IntoResponse, CoreError> {
    let readings = state.service.get_latest_per_sensor().await?;
    Ok(Json(readings))
}

/// Query parameters for `GET /readings/historical`.
#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    #[serde(alias = "sensorId")]
    sensor_id: Option<String>,
    #[serde(alias = "startDate")]
    start: Option<DateTime<Utc>>,
    #[serde(alias = "endDate")]
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn historical(
    State(state): State<AppState>,
    Query(params): Query<HistoricalQuery>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    debug!("GET /readings/historical - {:?}", params);
    let window = HistoryWindow {
        sensor_id: params.sensor_id,
        start: params.start,
        end: params.end,
        limit: params.limit,
    };
    let readings = state.service.historical_readings(window).await?;
    Ok(Json(readings))
}

/// Query parameters for `GET /readings/aggregate`.
#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    #[serde(alias = "sensorId")]
    sensor_id: Option<String>,
    #[serde(alias = "startDate")]
    start: Option<DateTime<Utc>>,
    #[serde(alias = "endDate")]
    end: Option<DateTime<Utc>>,
    /// Defaults to PM2.5.
    pollutant: Option<String>,
    /// `hour`, `day` or `month`; anything else means `hour`.
    interval: Option<String>,
}

impl AggregateQuery {
    fn into_filter(self) -> Result<AggregateFilter, CoreError> {
        // ---
        let pollutant = match self.pollutant.as_deref() {
            Some(p) => p.parse()?,
            None => Pollutant::Pm25,
        };
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(CoreError::invalid("start must not be after end"));
            }
        }

        let granularity = Granularity::parse_lenient(self.interval.as_deref());
        let mut filter = AggregateFilter::new(pollutant, granularity);
        filter.sensor_id = self.sensor_id.filter(|s| !s.is_empty());
        filter.start = self.start;
        filter.end = self.end;
        Ok(filter)
    }
}

async fn aggregate(
    State(state): State<AppState>,
    Query(params): Query<AggregateQuery>,
) -> Result<impl IntoResponse, CoreError> {
    // ---
    debug!("GET /readings/aggregate - {:?}", params);
    let filter = params.into_filter()?;
    let buckets = state.service.get_aggregates(&filter).await?;
    Ok(Json(buckets))
}
