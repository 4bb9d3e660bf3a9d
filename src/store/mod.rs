//! Persistence gateway.
//!
//! The core only talks to storage through [`Repository`]. Two
//! implementations live here (EMBP: siblings export one type each):
//! - `memory` – lock-guarded in-process store, also used by tests
//! - `postgres` – `sqlx` PostgreSQL store for deployments

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregate::latest_per_sensor;
use crate::error::CoreError;
use crate::models::{AlertRule, NewAlertRule, Notification, Reading, Sensor};

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

// ---

/// Reading query. Both time bounds are inclusive; results come back in
/// ascending timestamp order unless `newest_first` is set, in which case
/// `limit` keeps the most recent readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub sensor_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub newest_first: bool,
}

impl ReadingFilter {
    pub fn since(start: DateTime<Utc>) -> Self {
        ReadingFilter {
            start: Some(start),
            ..Default::default()
        }
    }

    /// True when the bounds cannot match anything.
    pub fn is_empty_window(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }

    pub fn matches(&self, reading: &Reading) -> bool {
        self.sensor_id.as_ref().map_or(true, |id| &reading.sensor_id == id)
            && self.start.map_or(true, |s| reading.timestamp >= s)
            && self.end.map_or(true, |e| reading.timestamp <= e)
    }
}

/// Narrow storage interface used by the pipeline, the aggregator and the
/// query surface. Every call is request/response.
#[async_trait]
pub trait Repository: Send + Sync {
    // ---
    async fn list_sensors(&self) -> Result<Vec<Sensor>, CoreError>;

    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, CoreError>;

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), CoreError>;

    /// Register a new sensor. `Conflict` when the id is taken.
    async fn insert_sensor(&self, sensor: &Sensor) -> Result<(), CoreError>;

    /// Replace every field of an existing sensor. `NotFound` when absent.
    async fn update_sensor(&self, sensor: &Sensor) -> Result<(), CoreError>;

    /// `NotFound` when absent, `Conflict` while readings still reference it.
    async fn delete_sensor(&self, id: &str) -> Result<(), CoreError>;

    /// Rules with `is_active = true`, across all users.
    async fn list_active_rules(&self) -> Result<Vec<AlertRule>, CoreError>;

    /// Every rule owned by `user_id`, active or not, newest first.
    async fn list_rules(&self, user_id: i64) -> Result<Vec<AlertRule>, CoreError>;

    async fn insert_rule(&self, rule: NewAlertRule) -> Result<AlertRule, CoreError>;

    /// Replace a rule. Matches on id and owner; `NotFound` otherwise.
    async fn update_rule(&self, rule: &AlertRule) -> Result<(), CoreError>;

    /// Matches on id and owner; `NotFound` otherwise.
    async fn delete_rule(&self, rule_id: i64, user_id: i64) -> Result<(), CoreError>;

    /// Returns `NotFound` when no rule has this id.
    async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), CoreError>;

    async fn query_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError>;

    async fn insert_reading(&self, reading: &Reading) -> Result<(), CoreError>;

    /// Most recent reading per sensor.
    async fn latest_readings(&self) -> Result<Vec<Reading>, CoreError> {
        let all = self.query_readings(&ReadingFilter::default()).await?;
        Ok(latest_per_sensor(&all))
    }

    /// Number of readings per sensor with `timestamp >= since`. Sensors with
    /// none are absent from the map.
    async fn reading_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, u64>, CoreError> {
        // ---
        let readings = self.query_readings(&ReadingFilter::since(since)).await?;
        let mut counts = HashMap::new();
        for reading in &readings {
            *counts.entry(reading.sensor_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), CoreError>;

    /// Newest first.
    async fn list_notifications(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<Notification>, CoreError>;

    /// Flip the read flag of one of `user_id`'s notifications. The only
    /// mutation a notification ever sees.
    async fn mark_notification_read(&self, id: Uuid, user_id: i64) -> Result<(), CoreError>;
}
