//! HTTP gateway over the query surface.
//!
//! Each sibling exports one subrouter; this gateway merges them and binds the
//! shared [`AppState`] (EMBP: `main.rs` only ever sees [`router`]).

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::CoreError;
use crate::service::AirQualityService;
use crate::sink::BroadcastSink;

mod alerts;
mod aqi;
mod compliance;
mod health;
mod notifications;
mod readings;
mod sensors;
mod ws;

// ---

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AirQualityService>,
    /// Source of live events for `/ws` subscribers.
    pub events: BroadcastSink,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(sensors::router())
        .merge(aqi::router())
        .merge(alerts::router())
        .merge(notifications::router())
        .merge(compliance::router())
        .merge(ws::router())
        .merge(health::router())
        .with_state(state)
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        // ---
        let status = match &self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::InternalInconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
