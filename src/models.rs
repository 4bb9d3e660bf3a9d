//! Data models for the air quality pipeline.
//!
//! Loosely-typed wire records (`RawReading`, `AlertRuleDraft`) are turned into
//! strongly-typed domain records here, so unknown pollutant kinds, operators
//! and channels are rejected at the boundary instead of travelling as strings.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ---

/// Pollutant kinds tracked by every sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pollutant {
    Pm25,
    Pm10,
    #[serde(alias = "o3")]
    Ozone,
    Co,
    No2,
    So2,
}

impl Pollutant {
    // ---
    pub const ALL: [Pollutant; 6] = [
        Pollutant::Pm25,
        Pollutant::Pm10,
        Pollutant::Ozone,
        Pollutant::Co,
        Pollutant::No2,
        Pollutant::So2,
    ];

    /// Storage / wire key, also the `sensor_data` column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Pollutant::Pm25 => "pm25",
            Pollutant::Pm10 => "pm10",
            Pollutant::Ozone => "ozone",
            Pollutant::Co => "co",
            Pollutant::No2 => "no2",
            Pollutant::So2 => "so2",
        }
    }

    /// Human readable name used in notification text.
    pub fn label(&self) -> &'static str {
        match self {
            Pollutant::Pm25 => "PM2.5",
            Pollutant::Pm10 => "PM10",
            Pollutant::Ozone => "Ozone",
            Pollutant::Co => "CO",
            Pollutant::No2 => "NO2",
            Pollutant::So2 => "SO2",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Pollutant::Pm25 | Pollutant::Pm10 => "µg/m³",
            Pollutant::Co => "ppm",
            Pollutant::Ozone | Pollutant::No2 | Pollutant::So2 => "ppb",
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pollutant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "pm25" | "pm2.5" | "pm2_5" => Ok(Pollutant::Pm25),
            "pm10" => Ok(Pollutant::Pm10),
            "ozone" | "o3" => Ok(Pollutant::Ozone),
            "co" => Ok(Pollutant::Co),
            "no2" => Ok(Pollutant::No2),
            "so2" => Ok(Pollutant::So2),
            other => Err(CoreError::invalid(format!("unknown pollutant '{other}'"))),
        }
    }
}

// ---

/// Per-pollutant concentrations of one reading. `None` means the sensor did
/// not report that pollutant, which is never the same as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Concentrations {
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub ozone: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub so2: Option<f64>,
}

impl Concentrations {
    // ---
    pub fn get(&self, pollutant: Pollutant) -> Option<f64> {
        match pollutant {
            Pollutant::Pm25 => self.pm25,
            Pollutant::Pm10 => self.pm10,
            Pollutant::Ozone => self.ozone,
            Pollutant::Co => self.co,
            Pollutant::No2 => self.no2,
            Pollutant::So2 => self.so2,
        }
    }

    /// Present pollutants in a fixed order.
    pub fn present(&self) -> impl Iterator<Item = (Pollutant, f64)> + '_ {
        Pollutant::ALL
            .into_iter()
            .filter_map(|p| self.get(p).map(|v| (p, v)))
    }
}

/// Optional weather fields reported alongside pollutants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
}

/// One immutable sensor reading. Persisted append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub id: Uuid,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub concentrations: Concentrations,
    #[serde(flatten)]
    pub weather: Weather,
}

impl Reading {
    // ---
    pub fn new(
        sensor_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        concentrations: Concentrations,
    ) -> Self {
        Reading {
            id: Uuid::new_v4(),
            sensor_id: sensor_id.into(),
            timestamp,
            concentrations,
            weather: Weather::default(),
        }
    }

    pub fn with_weather(mut self, weather: Weather) -> Self {
        self.weather = weather;
        self
    }

    pub fn value(&self, pollutant: Pollutant) -> Option<f64> {
        self.concentrations.get(pollutant)
    }
}

/// Reading as received from a sensor source or `POST /readings`.
///
/// Keys that are not known pollutants or weather fields are ignored by serde.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawReading {
    // ---
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    #[serde(alias = "o3")]
    pub ozone: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub so2: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
}

impl RawReading {
    // ---
    /// Validate and convert into a domain `Reading` with a fresh id.
    pub fn into_reading(self) -> Result<Reading, CoreError> {
        // ---
        if self.sensor_id.trim().is_empty() {
            return Err(CoreError::invalid("reading has an empty sensor_id"));
        }

        let concentrations = Concentrations {
            pm25: self.pm25,
            pm10: self.pm10,
            ozone: self.ozone,
            co: self.co,
            no2: self.no2,
            so2: self.so2,
        };
        for (pollutant, value) in concentrations.present() {
            if !value.is_finite() || value < 0.0 {
                return Err(CoreError::invalid(format!(
                    "{pollutant} concentration {value} is outside the accepted domain"
                )));
            }
        }

        let weather = Weather {
            temperature: self.temperature,
            humidity: self.humidity,
            wind_speed: self.wind_speed,
            wind_direction: self.wind_direction,
        };

        Ok(Reading::new(self.sensor_id, self.timestamp, concentrations).with_weather(weather))
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Maintenance,
    Offline,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Active => "active",
            SensorStatus::Maintenance => "maintenance",
            SensorStatus::Offline => "offline",
        }
    }
}

impl FromStr for SensorStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SensorStatus::Active),
            "maintenance" => Ok(SensorStatus::Maintenance),
            "offline" => Ok(SensorStatus::Offline),
            other => Err(CoreError::invalid(format!("unknown sensor status '{other}'"))),
        }
    }
}

/// A fixed-location sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: SensorStatus,
    /// 0-100
    pub battery_level: u8,
}

/// A sensor together with how many readings it delivered since the start
/// of the current UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorOverview {
    #[serde(flatten)]
    pub sensor: Sensor,
    pub data_points_today: u64,
}

/// Sensor definition as submitted for registration or update. On update
/// the id comes from the path and any `id` in the body is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorDraft {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: Option<String>,
    pub battery_level: Option<u8>,
}

impl SensorDraft {
    // ---
    pub fn validate(self) -> Result<Sensor, CoreError> {
        // ---
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(CoreError::invalid("sensor id is required"));
        }
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(CoreError::invalid("sensor name is required"));
        }
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(CoreError::invalid(format!(
                "coordinates ({}, {}) are out of range",
                self.latitude, self.longitude
            )));
        }

        let status = match self.status.as_deref() {
            Some(raw) => raw.parse()?,
            None => SensorStatus::Active,
        };
        let battery_level = self.battery_level.unwrap_or(100);
        if battery_level > 100 {
            return Err(CoreError::invalid(format!("battery_level {battery_level} is above 100")));
        }

        Ok(Sensor {
            id,
            name,
            latitude: self.latitude,
            longitude: self.longitude,
            status,
            battery_level,
        })
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    GreaterThan,
    LessThan,
    EqualTo,
}

impl ComparisonOperator {
    // ---
    /// Equality is exact on purpose; callers that need tolerance pre-round.
    pub fn apply(&self, observed: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => observed > threshold,
            ComparisonOperator::LessThan => observed < threshold,
            ComparisonOperator::EqualTo => observed == threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => "greater_than",
            ComparisonOperator::LessThan => "less_than",
            ComparisonOperator::EqualTo => "equal_to",
        }
    }

    pub fn phrase(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => "above",
            ComparisonOperator::LessThan => "below",
            ComparisonOperator::EqualTo => "equal to",
        }
    }
}

impl FromStr for ComparisonOperator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "greater_than" | ">" => Ok(ComparisonOperator::GreaterThan),
            "less_than" | "<" => Ok(ComparisonOperator::LessThan),
            "equal_to" | "=" | "==" => Ok(ComparisonOperator::EqualTo),
            other => Err(CoreError::invalid(format!("unknown comparison operator '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::InApp => "in_app",
        }
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "in_app" | "inapp" | "push" => Ok(Channel::InApp),
            other => Err(CoreError::invalid(format!("unknown notification channel '{other}'"))),
        }
    }
}

/// Serialize a channel set the way it is persisted: a JSON list of names.
pub fn channels_to_json(channels: &[Channel]) -> String {
    // ---
    let names: Vec<&str> = channels.iter().map(Channel::as_str).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a persisted channel list. An empty column means no channels.
pub fn channels_from_json(raw: &str) -> Result<Vec<Channel>, CoreError> {
    // ---
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let names: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| CoreError::invalid(format!("bad channel list '{raw}': {e}")))?;
    names.iter().map(|n| n.parse()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => f.write_str("low"),
            Severity::Medium => f.write_str("medium"),
            Severity::High => f.write_str("high"),
        }
    }
}

/// A user-owned threshold rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub pollutant: Pollutant,
    pub operator: ComparisonOperator,
    pub threshold: f64,
    /// Case-insensitive substring matched against the sensor name.
    pub location_filter: Option<String>,
    pub channels: Vec<Channel>,
    pub is_active: bool,
}

/// A validated rule that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlertRule {
    pub user_id: i64,
    pub name: String,
    pub pollutant: Pollutant,
    pub operator: ComparisonOperator,
    pub threshold: f64,
    pub location_filter: Option<String>,
    pub channels: Vec<Channel>,
    pub is_active: bool,
}

impl NewAlertRule {
    pub fn with_id(self, id: i64) -> AlertRule {
        AlertRule {
            id,
            user_id: self.user_id,
            name: self.name,
            pollutant: self.pollutant,
            operator: self.operator,
            threshold: self.threshold,
            location_filter: self.location_filter,
            channels: self.channels,
            is_active: self.is_active,
        }
    }
}

/// Rule definition as submitted by a user.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertRuleDraft {
    pub user_id: i64,
    pub name: String,
    pub pollutant_type: String,
    pub comparison_operator: String,
    pub threshold_value: Option<f64>,
    pub location_filter: Option<String>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl AlertRuleDraft {
    // ---
    pub fn validate(self) -> Result<NewAlertRule, CoreError> {
        // ---
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(CoreError::invalid("rule name is required"));
        }

        let pollutant: Pollutant = self.pollutant_type.parse()?;
        let operator: ComparisonOperator = self.comparison_operator.parse()?;

        let threshold = self
            .threshold_value
            .ok_or_else(|| CoreError::invalid("threshold_value is required"))?;
        if !threshold.is_finite() {
            return Err(CoreError::invalid(format!("threshold_value {threshold} is not finite")));
        }

        let mut channels = Vec::new();
        for raw in &self.notification_channels {
            let channel: Channel = raw.parse()?;
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        let location_filter = self
            .location_filter
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());

        Ok(NewAlertRule {
            user_id: self.user_id,
            name,
            pollutant,
            operator,
            threshold,
            location_filter,
            channels,
            is_active: self.is_active,
        })
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Alert,
    Manual,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Alert => "alert",
            NotificationKind::Manual => "manual",
        }
    }
}

/// A notification addressed to one user. Immutable except for `read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: i64,
    /// `None` for manual notifications.
    pub rule_id: Option<i64>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub channels: Vec<Channel>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    // ---
    /// Manual/test notification; defaults to the in-app channel.
    pub fn manual(
        user_id: i64,
        title: impl Into<String>,
        message: impl Into<String>,
        channels: Vec<Channel>,
        now: DateTime<Utc>,
    ) -> Self {
        let channels = if channels.is_empty() {
            vec![Channel::InApp]
        } else {
            channels
        };
        Notification {
            id: Uuid::new_v4(),
            user_id,
            rule_id: None,
            kind: NotificationKind::Manual,
            title: title.into(),
            message: message.into(),
            channels,
            read: false,
            created_at: now,
        }
    }
}
