//! In-process repository.
//!
//! Writes take the write lock and queries copy a snapshot under the read
//! lock, so a query sees every reading inserted before it started and never
//! sees one twice. Readings are kept per sensor, ordered by timestamp, and
//! capped: once a sensor holds more than the retention limit, its oldest
//! readings are dropped.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;
use uuid::Uuid;

use super::{ReadingFilter, Repository};
use crate::error::CoreError;
use crate::models::{
    AlertRule, Channel, ComparisonOperator, NewAlertRule, Notification, Pollutant, Reading, Sensor,
    SensorStatus,
};

// ---

/// Readings kept per sensor unless configured otherwise.
pub const DEFAULT_READINGS_PER_SENSOR: usize = 10_000;

/// Upper bound for range scans on `(timestamp, id)` keys.
const MAX_ID: Uuid = Uuid::from_u128(u128::MAX);

type ReadingKey = (DateTime<Utc>, Uuid);

#[derive(Default)]
struct Inner {
    sensors: BTreeMap<String, Sensor>,
    /// Per sensor; the newest reading is the last entry.
    readings: BTreeMap<String, BTreeMap<ReadingKey, Reading>>,
    rules: BTreeMap<i64, AlertRule>,
    notifications: Vec<Notification>,
    next_rule_id: i64,
}

pub struct MemoryRepository {
    inner: RwLock<Inner>,
    readings_per_sensor: usize,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::with_retention(DEFAULT_READINGS_PER_SENSOR)
    }
}

/// Demo fleet used when no database is configured.
const DEMO_SENSORS: &[(&str, &str, f64, f64)] = &[
    ("sensor_001", "Downtown Station", 40.7128, -74.0060),
    ("sensor_002", "Industrial Zone", 40.7589, -73.9851),
    ("sensor_003", "Residential Area", 40.6782, -73.9442),
    ("sensor_004", "Highway Monitor", 40.7505, -73.9934),
    ("sensor_005", "Park Station", 40.7829, -73.9654),
    ("sensor_006", "Airport Monitor", 40.6413, -73.7781),
    ("sensor_007", "Harbor Station", 40.7074, -74.0113),
    ("sensor_008", "University Campus", 40.8075, -73.9626),
    ("sensor_009", "Shopping District", 40.7505, -73.9934),
    ("sensor_010", "Suburban Monitor", 40.6892, -74.0445),
];

impl MemoryRepository {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store keeping at most `readings_per_sensor` readings per sensor.
    pub fn with_retention(readings_per_sensor: usize) -> Self {
        MemoryRepository {
            inner: RwLock::new(Inner::default()),
            readings_per_sensor: readings_per_sensor.max(1),
        }
    }

    /// Store pre-loaded with the demo sensors and two PM threshold rules
    /// owned by user 1.
    pub fn seeded_demo() -> Self {
        Self::seeded_demo_with_retention(DEFAULT_READINGS_PER_SENSOR)
    }

    pub fn seeded_demo_with_retention(readings_per_sensor: usize) -> Self {
        // ---
        let repo = Self::with_retention(readings_per_sensor);
        {
            let mut inner = repo.inner.write();
            for (id, name, lat, lon) in DEMO_SENSORS {
                inner.sensors.insert(
                    id.to_string(),
                    Sensor {
                        id: id.to_string(),
                        name: name.to_string(),
                        latitude: *lat,
                        longitude: *lon,
                        status: SensorStatus::Active,
                        battery_level: 100,
                    },
                );
            }

            let defaults = [
                ("PM2.5 above 24h standard", Pollutant::Pm25, 35.0),
                ("PM10 above 24h standard", Pollutant::Pm10, 150.0),
            ];
            for (name, pollutant, threshold) in defaults {
                inner.next_rule_id += 1;
                let id = inner.next_rule_id;
                inner.rules.insert(
                    id,
                    AlertRule {
                        id,
                        user_id: 1,
                        name: name.to_string(),
                        pollutant,
                        operator: ComparisonOperator::GreaterThan,
                        threshold,
                        location_filter: None,
                        channels: vec![Channel::InApp],
                        is_active: true,
                    },
                );
            }
        }
        repo
    }

    pub fn reading_count(&self) -> usize {
        self.inner.read().readings.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    // ---
    async fn list_sensors(&self) -> Result<Vec<Sensor>, CoreError> {
        Ok(self.inner.read().sensors.values().cloned().collect())
    }

    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, CoreError> {
        Ok(self.inner.read().sensors.get(id).cloned())
    }

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), CoreError> {
        self.inner.write().sensors.insert(sensor.id.clone(), sensor.clone());
        Ok(())
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<(), CoreError> {
        // ---
        let mut inner = self.inner.write();
        if inner.sensors.contains_key(&sensor.id) {
            return Err(CoreError::Conflict(format!("sensor {} already exists", sensor.id)));
        }
        inner.sensors.insert(sensor.id.clone(), sensor.clone());
        Ok(())
    }

    async fn update_sensor(&self, sensor: &Sensor) -> Result<(), CoreError> {
        match self.inner.write().sensors.get_mut(&sensor.id) {
            Some(existing) => {
                *existing = sensor.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("sensor {}", sensor.id))),
        }
    }

    async fn delete_sensor(&self, id: &str) -> Result<(), CoreError> {
        // ---
        let mut inner = self.inner.write();
        if !inner.sensors.contains_key(id) {
            return Err(CoreError::NotFound(format!("sensor {id}")));
        }
        if inner.readings.get(id).is_some_and(|series| !series.is_empty()) {
            return Err(CoreError::Conflict(format!("sensor {id} still has readings")));
        }
        inner.sensors.remove(id);
        inner.readings.remove(id);
        Ok(())
    }

    async fn list_active_rules(&self) -> Result<Vec<AlertRule>, CoreError> {
        Ok(self
            .inner
            .read()
            .rules
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    async fn list_rules(&self, user_id: i64) -> Result<Vec<AlertRule>, CoreError> {
        // Ids are handed out in creation order
        Ok(self
            .inner
            .read()
            .rules
            .values()
            .rev()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_rule(&self, rule: NewAlertRule) -> Result<AlertRule, CoreError> {
        // ---
        let mut inner = self.inner.write();
        inner.next_rule_id += 1;
        let rule = rule.with_id(inner.next_rule_id);
        inner.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: &AlertRule) -> Result<(), CoreError> {
        match self.inner.write().rules.get_mut(&rule.id) {
            Some(existing) if existing.user_id == rule.user_id => {
                *existing = rule.clone();
                Ok(())
            }
            _ => Err(CoreError::NotFound(format!("alert rule {}", rule.id))),
        }
    }

    async fn delete_rule(&self, rule_id: i64, user_id: i64) -> Result<(), CoreError> {
        // ---
        let mut inner = self.inner.write();
        if !inner.rules.get(&rule_id).is_some_and(|r| r.user_id == user_id) {
            return Err(CoreError::NotFound(format!("alert rule {rule_id}")));
        }
        inner.rules.remove(&rule_id);

        // Same as ON DELETE SET NULL on the notifications table
        for n in inner.notifications.iter_mut().filter(|n| n.rule_id == Some(rule_id)) {
            n.rule_id = None;
        }
        Ok(())
    }

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), CoreError> {
        match self.inner.write().rules.get_mut(&rule_id) {
            Some(rule) => {
                rule.is_active = active;
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("alert rule {rule_id}"))),
        }
    }

    async fn query_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError> {
        // ---
        if filter.is_empty_window() {
            return Ok(Vec::new());
        }
        let lower = filter.start.map_or(Bound::Unbounded, |s| Bound::Included((s, Uuid::nil())));
        let upper = filter.end.map_or(Bound::Unbounded, |e| Bound::Included((e, MAX_ID)));

        let inner = self.inner.read();
        let mut out: Vec<Reading> = match &filter.sensor_id {
            Some(id) => inner
                .readings
                .get(id)
                .map(|series| series.range((lower, upper)).map(|(_, r)| r.clone()).collect())
                .unwrap_or_default(),
            None => inner
                .readings
                .values()
                .flat_map(|series| series.range((lower, upper)).map(|(_, r)| r.clone()))
                .collect(),
        };
        drop(inner);

        out.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
        if filter.newest_first {
            out.reverse();
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<(), CoreError> {
        // ---
        let mut inner = self.inner.write();
        let series = inner.readings.entry(reading.sensor_id.clone()).or_default();
        series.insert((reading.timestamp, reading.id), reading.clone());

        while series.len() > self.readings_per_sensor {
            if let Some(((timestamp, _), _)) = series.pop_first() {
                trace!(sensor_id = %reading.sensor_id, %timestamp, "Dropped oldest reading");
            }
        }
        Ok(())
    }

    async fn latest_readings(&self) -> Result<Vec<Reading>, CoreError> {
        // ---
        Ok(self
            .inner
            .read()
            .readings
            .values()
            .filter_map(|series| series.last_key_value().map(|(_, r)| r.clone()))
            .collect())
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), CoreError> {
        self.inner.write().notifications.push(notification.clone());
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<Notification>, CoreError> {
        // ---
        let inner = self.inner.read();
        let mut out: Vec<Notification> = inner
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn mark_notification_read(&self, id: Uuid, user_id: i64) -> Result<(), CoreError> {
        match self
            .inner
            .write()
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
        {
            Some(n) => {
                n.read = true;
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("notification {id}"))),
        }
    }
}
