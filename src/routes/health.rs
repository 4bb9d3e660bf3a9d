// src/routes/health.rs
//! Liveness endpoint for the air quality service.
//!
//! Used by container orchestrators and CI to check that the process is up and
//! answering HTTP. Sibling module of the `routes` gateway (EMBP):
//! - Internal to this file: the handler and its response type
//! - Exports to the gateway (`mod.rs`): a subrouter with `/health`

use axum::{routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Handle `GET /health`. Does not touch the store or the sink.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Subrouter with the `/health` route, generic over the gateway state so it
/// merges regardless of the state type.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
