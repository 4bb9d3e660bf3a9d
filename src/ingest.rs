//! Periodic ingestion loop.
//!
//! Every tick lists the fleet and schedules one task per active sensor: pull
//! a sample from the [`ReadingSource`], record the battery level, then run the
//! reading through the [`AlertPipeline`]. Tasks live in a `JoinSet` bounded
//! by a semaphore. A stop signal halts scheduling and then drains whatever is
//! already in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::with_timeout;
use crate::models::{Sensor, SensorStatus};
use crate::pipeline::AlertPipeline;
use crate::sink::{FanoutSink, PipelineEvent};
use crate::source::ReadingSource;
use crate::store::Repository;

// ---

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub interval: Duration,
    /// Max sensor tasks running at once.
    pub concurrency: usize,
    pub io_timeout: Duration,
    /// Battery percentage below which a maintenance event is published.
    pub low_battery_threshold: u8,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            interval: Duration::from_secs(30),
            concurrency: 8,
            io_timeout: Duration::from_secs(5),
            low_battery_threshold: 20,
        }
    }
}

/// A sensor's entry in the busy set, released on drop so that a task that
/// panics does not lock its sensor out of every later tick.
struct BusySlot {
    owner: Arc<IngestionLoop>,
    sensor_id: String,
}

impl Drop for BusySlot {
    fn drop(&mut self) {
        self.owner.busy.lock().remove(&self.sensor_id);
    }
}

pub struct IngestionLoop {
    repo: Arc<dyn Repository>,
    source: Arc<dyn ReadingSource>,
    pipeline: Arc<AlertPipeline>,
    sink: Arc<dyn FanoutSink>,
    config: IngestConfig,
    /// Sensors with a task still running; a slow sensor is not stacked up.
    busy: Mutex<HashSet<String>>,
}

/// Owner of a running loop. Dropping it also stops scheduling, but only
/// [`IngestionHandle::stop`] waits for the in-flight tasks.
pub struct IngestionHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngestionHandle {
    pub async fn stop(self) {
        // ---
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Ingestion loop ended abnormally: {}", e);
        }
    }
}

impl IngestionLoop {
    // ---
    pub fn new(
        repo: Arc<dyn Repository>,
        source: Arc<dyn ReadingSource>,
        pipeline: Arc<AlertPipeline>,
        sink: Arc<dyn FanoutSink>,
        config: IngestConfig,
    ) -> Self {
        IngestionLoop {
            repo,
            source,
            pipeline,
            sink,
            config,
            busy: Mutex::new(HashSet::new()),
        }
    }

    pub fn spawn(self) -> IngestionHandle {
        // ---
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::new(self).run(stop_rx));
        IngestionHandle { stop_tx, task }
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        // ---
        info!(
            "Ingestion loop started: every {:?}, {} concurrent sensors",
            self.config.interval, self.config.concurrency
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => break,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Sensor task failed: {}", e);
                    }
                }

                _ = ticker.tick() => {
                    self.schedule_tick(&mut in_flight, &permits).await;
                }
            }
        }

        info!("Ingestion stopping, draining {} in-flight tasks", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Sensor task failed: {}", e);
            }
        }
        info!("Ingestion loop stopped");
    }

    async fn schedule_tick(
        self: &Arc<Self>,
        in_flight: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
    ) {
        // ---
        let evicted = self.pipeline.dedup().evict_expired(self.pipeline.now());
        if evicted > 0 {
            debug!("Dedup eviction removed {} entries", evicted);
        }

        let listed = with_timeout("database", self.config.io_timeout, self.repo.list_sensors());
        let sensors = match listed.await {
            Ok(sensors) => sensors,
            Err(e) => {
                warn!(error = %e, "Could not list sensors, skipping tick");
                return;
            }
        };

        let mut scheduled = 0;
        for sensor in sensors {
            if sensor.status != SensorStatus::Active {
                debug!(
                    sensor_id = %sensor.id,
                    status = sensor.status.as_str(),
                    "Sensor not active, skipping"
                );
                continue;
            }
            if !self.busy.lock().insert(sensor.id.clone()) {
                debug!(sensor_id = %sensor.id, "Previous tick still running, skipping");
                continue;
            }

            let slot = BusySlot {
                owner: Arc::clone(self),
                sensor_id: sensor.id.clone(),
            };
            let permits = Arc::clone(permits);
            in_flight.spawn(async move {
                // Closed only if the semaphore is dropped, which never happens while tasks exist
                if let Ok(_permit) = permits.acquire_owned().await {
                    slot.owner.ingest_one(&sensor).await;
                }
                drop(slot);
            });
            scheduled += 1;
        }
        debug!("Tick scheduled {} sensor tasks", scheduled);
    }

    async fn ingest_one(&self, sensor: &Sensor) {
        // ---
        let sample = match self.source.fetch(sensor).await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                debug!(sensor_id = %sensor.id, "No new reading");
                return;
            }
            Err(e) => {
                warn!(sensor_id = %sensor.id, error = %e, "Reading source failed");
                return;
            }
        };

        let mut sensor = sensor.clone();
        if let Some(level) = sample.battery_level {
            if level != sensor.battery_level {
                sensor.battery_level = level;
                let upsert = self.repo.upsert_sensor(&sensor);
                if let Err(e) = with_timeout("database", self.config.io_timeout, upsert).await {
                    warn!(sensor_id = %sensor.id, error = %e, "Failed to record battery level");
                }
            }
        }

        if sensor.battery_level < self.config.low_battery_threshold {
            info!(sensor_id = %sensor.id, battery = sensor.battery_level, "Low battery");
            let event = PipelineEvent::Maintenance {
                sensor_id: sensor.id.clone(),
                battery_level: sensor.battery_level,
            };
            let publish = self.sink.publish(event);
            if let Err(e) = with_timeout("fan-out sink", self.config.io_timeout, publish).await {
                warn!(sensor_id = %sensor.id, error = %e, "Failed to publish maintenance event");
            }
        }

        self.pipeline.process(sample.reading, &sensor).await;
    }
}
