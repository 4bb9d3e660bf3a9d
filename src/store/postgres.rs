//! PostgreSQL repository backed by a `sqlx` pool.
//!
//! Enum-valued columns are TEXT and re-parsed on the way out; a row that no
//! longer parses (hand-edited data, retired pollutant) is skipped with a
//! warning rather than failing the whole query.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;
use uuid::Uuid;

use super::{ReadingFilter, Repository};
use crate::error::CoreError;
use crate::models::{
    channels_from_json, channels_to_json, AlertRule, Concentrations, NewAlertRule, Notification,
    NotificationKind, Reading, Sensor, Weather,
};

// ---

const RULE_COLUMNS: &str = "id, user_id, name, pollutant_type, threshold_value, \
                            comparison_operator, location_filter, notification_channels, is_active";

const READING_COLUMNS: &str = "id, sensor_id, timestamp, pm25, pm10, ozone, co, no2, so2, \
                               temperature, humidity, wind_speed, wind_direction";

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    id: Uuid,
    sensor_id: String,
    timestamp: DateTime<Utc>,
    pm25: Option<f64>,
    pm10: Option<f64>,
    ozone: Option<f64>,
    co: Option<f64>,
    no2: Option<f64>,
    so2: Option<f64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    wind_speed: Option<f64>,
    wind_direction: Option<f64>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            id: row.id,
            sensor_id: row.sensor_id,
            timestamp: row.timestamp,
            concentrations: Concentrations {
                pm25: row.pm25,
                pm10: row.pm10,
                ozone: row.ozone,
                co: row.co,
                no2: row.no2,
                so2: row.so2,
            },
            weather: Weather {
                temperature: row.temperature,
                humidity: row.humidity,
                wind_speed: row.wind_speed,
                wind_direction: row.wind_direction,
            },
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SensorRow {
    id: String,
    name: String,
    latitude: f64,
    longitude: f64,
    status: String,
    battery_level: i16,
}

impl TryFrom<SensorRow> for Sensor {
    type Error = CoreError;

    fn try_from(row: SensorRow) -> Result<Self, Self::Error> {
        Ok(Sensor {
            status: row.status.parse()?,
            battery_level: row.battery_level.clamp(0, 100) as u8,
            id: row.id,
            name: row.name,
            latitude: row.latitude,
            longitude: row.longitude,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: i64,
    user_id: i64,
    name: String,
    pollutant_type: String,
    threshold_value: f64,
    comparison_operator: String,
    location_filter: Option<String>,
    notification_channels: String,
    is_active: bool,
}

impl TryFrom<RuleRow> for AlertRule {
    type Error = CoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(AlertRule {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            pollutant: row.pollutant_type.parse()?,
            operator: row.comparison_operator.parse()?,
            threshold: row.threshold_value,
            location_filter: row.location_filter.filter(|f| !f.trim().is_empty()),
            channels: channels_from_json(&row.notification_channels)?,
            is_active: row.is_active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: i64,
    alert_id: Option<i64>,
    title: String,
    message: String,
    #[sqlx(rename = "type")]
    kind: String,
    channels: String,
    read: bool,
    timestamp: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = CoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "manual" => NotificationKind::Manual,
            _ => NotificationKind::Alert,
        };
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            rule_id: row.alert_id,
            kind,
            title: row.title,
            message: row.message,
            channels: channels_from_json(&row.channels)?,
            read: row.read,
            created_at: row.timestamp,
        })
    }
}

/// Convert rows, dropping (and logging) the ones that fail to parse.
fn convert_rows<R, T>(rows: Vec<R>, what: &str) -> Vec<T>
where
    T: TryFrom<R, Error = CoreError>,
{
    // ---
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Skipping unparseable {} row: {}", what, e);
                None
            }
        })
        .collect()
}

// ---

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        PgRepository { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    // ---
    async fn list_sensors(&self) -> Result<Vec<Sensor>, CoreError> {
        let rows: Vec<SensorRow> = sqlx::query_as(
            "SELECT id, name, latitude, longitude, status, battery_level FROM sensors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(convert_rows(rows, "sensor"))
    }

    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, CoreError> {
        let row: Option<SensorRow> = sqlx::query_as(
            "SELECT id, name, latitude, longitude, status, battery_level \
             FROM sensors WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Sensor::try_from).transpose()
    }

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), CoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO sensors (id, name, latitude, longitude, status, battery_level)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                status = EXCLUDED.status,
                battery_level = EXCLUDED.battery_level
            "#,
        )
        .bind(&sensor.id)
        .bind(&sensor.name)
        .bind(sensor.latitude)
        .bind(sensor.longitude)
        .bind(sensor.status.as_str())
        .bind(sensor.battery_level as i16)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<(), CoreError> {
        // ---
        // A duplicate id is a unique violation, reported as Conflict
        sqlx::query(
            r#"
            INSERT INTO sensors (id, name, latitude, longitude, status, battery_level)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&sensor.id)
        .bind(&sensor.name)
        .bind(sensor.latitude)
        .bind(sensor.longitude)
        .bind(sensor.status.as_str())
        .bind(sensor.battery_level as i16)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_sensor(&self, sensor: &Sensor) -> Result<(), CoreError> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE sensors
            SET name = $2, latitude = $3, longitude = $4, status = $5, battery_level = $6
            WHERE id = $1
            "#,
        )
        .bind(&sensor.id)
        .bind(&sensor.name)
        .bind(sensor.latitude)
        .bind(sensor.longitude)
        .bind(sensor.status.as_str())
        .bind(sensor.battery_level as i16)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("sensor {}", sensor.id)));
        }
        Ok(())
    }

    async fn delete_sensor(&self, id: &str) -> Result<(), CoreError> {
        // ---
        // sensor_data references sensors, so a sensor with readings fails
        // with a foreign key violation (Conflict)
        let result = sqlx::query("DELETE FROM sensors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("sensor {id}")));
        }
        Ok(())
    }

    async fn list_active_rules(&self) -> Result<Vec<AlertRule>, CoreError> {
        // ---
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(convert_rows(rows, "alert rule"))
    }

    async fn list_rules(&self, user_id: i64) -> Result<Vec<AlertRule>, CoreError> {
        // ---
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(convert_rows(rows, "alert rule"))
    }

    async fn insert_rule(&self, rule: NewAlertRule) -> Result<AlertRule, CoreError> {
        // ---
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO alert_rules (
                user_id, name, pollutant_type, threshold_value, comparison_operator,
                location_filter, notification_channels, is_active
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(rule.user_id)
        .bind(&rule.name)
        .bind(rule.pollutant.as_str())
        .bind(rule.threshold)
        .bind(rule.operator.as_str())
        .bind(rule.location_filter.as_deref())
        .bind(channels_to_json(&rule.channels))
        .bind(rule.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(rule.with_id(id))
    }

    async fn update_rule(&self, rule: &AlertRule) -> Result<(), CoreError> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE alert_rules
            SET name = $3, pollutant_type = $4, threshold_value = $5, comparison_operator = $6,
                location_filter = $7, notification_channels = $8, is_active = $9
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(rule.id)
        .bind(rule.user_id)
        .bind(&rule.name)
        .bind(rule.pollutant.as_str())
        .bind(rule.threshold)
        .bind(rule.operator.as_str())
        .bind(rule.location_filter.as_deref())
        .bind(channels_to_json(&rule.channels))
        .bind(rule.is_active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("alert rule {}", rule.id)));
        }
        Ok(())
    }

    async fn delete_rule(&self, rule_id: i64, user_id: i64) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1 AND user_id = $2")
            .bind(rule_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("alert rule {rule_id}")));
        }
        Ok(())
    }

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE alert_rules SET is_active = $1 WHERE id = $2")
            .bind(active)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("alert rule {rule_id}")));
        }
        Ok(())
    }

    async fn query_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError> {
        // ---
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {READING_COLUMNS} FROM sensor_data WHERE 1=1"));

        if let Some(sensor_id) = &filter.sensor_id {
            qb.push(" AND sensor_id = ").push_bind(sensor_id.clone());
        }
        if let Some(start) = filter.start {
            qb.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = filter.end {
            qb.push(" AND timestamp <= ").push_bind(end);
        }
        if filter.newest_first {
            qb.push(" ORDER BY timestamp DESC, id DESC");
        } else {
            qb.push(" ORDER BY timestamp ASC, id ASC");
        }
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build_query_as::<ReadingRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<(), CoreError> {
        // ---
        let c = &reading.concentrations;
        let w = &reading.weather;
        sqlx::query(
            r#"
            INSERT INTO sensor_data (
                id, sensor_id, timestamp, pm25, pm10, ozone, co, no2, so2,
                temperature, humidity, wind_speed, wind_direction
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(reading.id)
        .bind(&reading.sensor_id)
        .bind(reading.timestamp)
        .bind(c.pm25)
        .bind(c.pm10)
        .bind(c.ozone)
        .bind(c.co)
        .bind(c.no2)
        .bind(c.so2)
        .bind(w.temperature)
        .bind(w.humidity)
        .bind(w.wind_speed)
        .bind(w.wind_direction)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_readings(&self) -> Result<Vec<Reading>, CoreError> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            "SELECT DISTINCT ON (sensor_id) {READING_COLUMNS} FROM sensor_data \
             ORDER BY sensor_id, timestamp DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    async fn reading_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, u64>, CoreError> {
        // ---
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sensor_id, COUNT(*) FROM sensor_data WHERE timestamp >= $1 GROUP BY sensor_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(sensor_id, count)| (sensor_id, count.max(0) as u64))
            .collect())
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), CoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, user_id, alert_id, title, message, type, channels, read, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(notification.rule_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind.as_str())
        .bind(channels_to_json(&notification.channels))
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<Notification>, CoreError> {
        // ---
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, alert_id, title, message, type, channels, read, timestamp
            FROM notifications
            WHERE user_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(convert_rows(rows, "notification"))
    }

    async fn mark_notification_read(&self, id: Uuid, user_id: i64) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read = TRUE WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("notification {id}")));
        }
        Ok(())
    }
}
