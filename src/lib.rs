//! Reading-processing pipeline for the air quality monitoring service.
//!
//! Pure core:
//! - `aqi` – breakpoint-table AQI conversion
//! - `rules` – rule matching and severity classification
//! - `dedup` – cooldown tracking per `(rule, sensor)`
//! - `aggregate` – hour/day/month rollups and latest-per-sensor
//!
//! Orchestration and collaborators:
//! - `pipeline` – per-reading state machine
//! - `ingest` – cancellable periodic ingestion loop
//! - `store`, `sink`, `source` – persistence, fan-out and reading sources
//! - `service`, `routes` – query surface and its HTTP gateway
//!
//! Follows the Explicit Module Boundary Pattern (EMBP): sibling modules reach
//! each other only through what is re-exported here or declared `pub`.

pub mod aggregate;
pub mod aqi;
pub mod compliance;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod rules;
pub mod schema;
pub mod service;
pub mod sink;
pub mod source;
pub mod store;

pub use config::Config;
pub use error::CoreError;
pub use models::{Pollutant, RawReading, Reading, Sensor};
pub use pipeline::AlertPipeline;
pub use service::AirQualityService;
