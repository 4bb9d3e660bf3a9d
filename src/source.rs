//! Sensor reading sources.
//!
//! The ingestion loop asks a [`ReadingSource`] for the current sample of one
//! sensor per tick. Two sources ship with the service:
//! - [`Simulator`] – synthetic but plausible telemetry for demos
//! - [`HttpSource`] – cursor-paginated pull from an external sensor API

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::dedup::Clock;
use crate::error::CoreError;
use crate::models::{Concentrations, RawReading, Reading, Sensor, Weather};

// ---

/// One sample for one sensor. Devices may also report their battery level.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSample {
    pub reading: Reading,
    pub battery_level: Option<u8>,
}

#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// `Ok(None)` means the sensor had nothing new this tick.
    async fn fetch(&self, sensor: &Sensor) -> Result<Option<SourceSample>, CoreError>;
}

// ---

/// Synthetic generator. PM2.5 follows a slow hourly wave plus noise and PM10
/// tracks PM2.5; the gases are uniform noise around urban background levels.
pub struct Simulator {
    clock: Arc<dyn Clock>,
}

impl Simulator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Simulator { clock }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[async_trait]
impl ReadingSource for Simulator {
    async fn fetch(&self, sensor: &Sensor) -> Result<Option<SourceSample>, CoreError> {
        // ---
        let now = self.clock.now();
        let millis = now.timestamp_millis() as f64;

        let mut rng = rand::thread_rng();
        let pm25 = (15.0 + rng.gen_range(0.0..30.0) + (millis / 3_600_000.0).sin() * 10.0).max(0.0);
        let pm10 = pm25 * rng.gen_range(1.5..2.0);
        let ozone = 40.0 + rng.gen_range(0.0..60.0);
        let co = 0.5 + rng.gen_range(0.0..2.0);
        let no2 = 20.0 + rng.gen_range(0.0..40.0);
        let so2 = 5.0 + rng.gen_range(0.0..15.0);

        let temperature = 20.0 + rng.gen_range(0.0..15.0) + (millis / 86_400_000.0).sin() * 5.0;
        let humidity: f64 = 40.0 + rng.gen_range(0.0..40.0);
        let wind_speed = rng.gen_range(0.0..12.0);
        let wind_direction = rng.gen_range(0.0..2.0 * PI).to_degrees();

        let battery_level = rng.gen_range(80..=100u8);

        let concentrations = Concentrations {
            pm25: Some(round_to(pm25, 1)),
            pm10: Some(round_to(pm10, 1)),
            ozone: Some(round_to(ozone, 1)),
            co: Some(round_to(co, 2)),
            no2: Some(round_to(no2, 1)),
            so2: Some(round_to(so2, 1)),
        };
        let weather = Weather {
            temperature: Some(round_to(temperature, 1)),
            humidity: Some(humidity.round()),
            wind_speed: Some(round_to(wind_speed, 1)),
            wind_direction: Some(wind_direction.round()),
        };

        Ok(Some(SourceSample {
            reading: Reading::new(sensor.id.clone(), now, concentrations).with_weather(weather),
            battery_level: Some(battery_level),
        }))
    }
}

// ---

/// Pulls readings for one sensor from `{base_url}?sensor_id=..`, following
/// `next_cursor` across `results` pages, and keeps the newest.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    max_pages: u32,
}

impl HttpSource {
    // ---
    pub fn new(
        base_url: impl Into<String>,
        max_pages: u32,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpSource {
            client,
            base_url: base_url.into(),
            max_pages,
        })
    }

    /// Query pairs for one page. reqwest percent-encodes them, so ids and
    /// opaque cursors may hold any characters.
    fn page_query<'a>(sensor_id: &'a str, cursor: Option<&'a str>) -> Vec<(&'static str, &'a str)> {
        let mut query = vec![("sensor_id", sensor_id)];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        query
    }
}

#[async_trait]
impl ReadingSource for HttpSource {
    async fn fetch(&self, sensor: &Sensor) -> Result<Option<SourceSample>, CoreError> {
        // ---
        let mut newest: Option<SourceSample> = None;
        let mut cursor: Option<String> = None;
        let mut page_count = 0;
        let mut item_count = 0usize;

        loop {
            if page_count >= self.max_pages {
                debug!(
                    sensor_id = %sensor.id,
                    "Hit page limit of {}, stopping pagination after {} items",
                    self.max_pages,
                    item_count
                );
                break;
            }
            page_count += 1;

            let query = Self::page_query(&sensor.id, cursor.as_deref());
            debug!("Fetching page {} from: {} {:?}", page_count, self.base_url, query);

            let response: serde_json::Value = self
                .client
                .get(&self.base_url)
                .query(&query)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if let Some(items) = response.get("results").and_then(|d| d.as_array()) {
                for (i, item) in items.iter().enumerate() {
                    item_count += 1;
                    let parsed = serde_json::from_value::<RawReading>(item.clone())
                        .map_err(|e| CoreError::invalid(e.to_string()))
                        .and_then(RawReading::into_reading);
                    let reading = match parsed {
                        Ok(r) if r.sensor_id == sensor.id => r,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(
                                "Failed to parse item {} on page {}: {} - Raw item: {}",
                                i, page_count, e, item
                            );
                            continue;
                        }
                    };

                    let is_newer = newest
                        .as_ref()
                        .map_or(true, |best| reading.timestamp > best.reading.timestamp);
                    if is_newer {
                        let battery_level = item
                            .get("battery_level")
                            .and_then(|b| b.as_f64())
                            .map(|b| b.round().clamp(0.0, 100.0) as u8);
                        newest = Some(SourceSample { reading, battery_level });
                    }
                }
            } else {
                debug!("Page {} response missing 'results' field or not an array", page_count);
            }

            cursor = response
                .get("next_cursor")
                .and_then(|c| c.as_str())
                .map(String::from);

            if cursor.is_none() {
                break;
            }
        }

        info!(
            sensor_id = %sensor.id,
            "Fetched {} items from {} pages",
            item_count,
            page_count
        );
        Ok(newest)
    }
}
