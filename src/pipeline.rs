//! Alert evaluation pipeline.
//!
//! Drives one reading through
//! `RECEIVED → AQI_COMPUTED → RULES_EVALUATED → [NOTIFIED | SUPPRESSED] → DONE`.
//! Nothing in here aborts the whole reading: a bad pollutant, a bad rule or a
//! slow dependency is logged with its context and skipped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aqi::{compute_aqi, AqiResult};
use crate::dedup::{Clock, Deduplicator};
use crate::error::with_timeout;
use crate::models::{AlertRule, Channel, Notification, NotificationKind, Reading, Sensor};
use crate::rules::{evaluate, MatchResult};
use crate::sink::{FanoutSink, PipelineEvent};
use crate::store::Repository;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    AqiComputed,
    RulesEvaluated,
    Notified,
    Suppressed,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Received => "RECEIVED",
            PipelineStage::AqiComputed => "AQI_COMPUTED",
            PipelineStage::RulesEvaluated => "RULES_EVALUATED",
            PipelineStage::Notified => "NOTIFIED",
            PipelineStage::Suppressed => "SUPPRESSED",
            PipelineStage::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// A reading with the AQI of every pollutant it reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedReading {
    pub reading: Reading,
    pub aqi: Vec<AqiResult>,
}

/// What one pass through the pipeline produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub enriched: EnrichedReading,
    pub notifications: Vec<Notification>,
    /// Rules that matched but were held back by the cooldown.
    pub suppressed: Vec<i64>,
    /// Rules that could not be evaluated.
    pub rule_failures: usize,
}

// ---

pub struct AlertPipeline {
    repo: Arc<dyn Repository>,
    sink: Arc<dyn FanoutSink>,
    dedup: Arc<Deduplicator>,
    clock: Arc<dyn Clock>,
    io_timeout: Duration,
}

impl AlertPipeline {
    // ---
    pub fn new(
        repo: Arc<dyn Repository>,
        sink: Arc<dyn FanoutSink>,
        dedup: Arc<Deduplicator>,
        clock: Arc<dyn Clock>,
        io_timeout: Duration,
    ) -> Self {
        AlertPipeline {
            repo,
            sink,
            dedup,
            clock,
            io_timeout,
        }
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `reading`, taken by `sensor`, through every stage. Never fails;
    /// the returned outcome carries whatever could be computed.
    pub async fn process(&self, reading: Reading, sensor: &Sensor) -> PipelineOutcome {
        // ---
        let sensor_id = sensor.id.as_str();
        debug!(
            sensor_id,
            reading_id = %reading.id,
            stage = %PipelineStage::Received,
            "Pipeline start"
        );

        let insert = self.repo.insert_reading(&reading);
        if let Err(e) = with_timeout("database", self.io_timeout, insert).await {
            warn!(sensor_id, error = %e, "Failed to persist reading, continuing");
        }

        // AQI_COMPUTED
        let aqi = compute_all_aqi(&reading);
        let enriched = EnrichedReading { reading, aqi };
        debug!(sensor_id, pollutants = enriched.aqi.len(), stage = %PipelineStage::AqiComputed);

        self.publish(PipelineEvent::SensorData {
            reading: enriched.reading.clone(),
            aqi: enriched.aqi.clone(),
        })
        .await;

        let mut outcome = PipelineOutcome {
            enriched,
            notifications: Vec::new(),
            suppressed: Vec::new(),
            rule_failures: 0,
        };

        // RULES_EVALUATED
        let rules = match with_timeout("database", self.io_timeout, self.repo.list_active_rules())
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                warn!(sensor_id, error = %e, "Could not load alert rules, skipping evaluation");
                return outcome;
            }
        };

        let mut matches: Vec<(AlertRule, MatchResult)> = Vec::new();
        for rule in rules.into_iter().filter(|r| r.is_active) {
            match evaluate(&rule, &outcome.enriched.reading, sensor) {
                Ok(result) if result.matched => matches.push((rule, result)),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        rule_id = rule.id,
                        sensor_id,
                        error = %e,
                        "Rule evaluation failed, skipping rule"
                    );
                    outcome.rule_failures += 1;
                }
            }
        }
        debug!(sensor_id, matched = matches.len(), stage = %PipelineStage::RulesEvaluated);

        for (rule, result) in matches {
            let now = self.clock.now();
            if !self.dedup.try_fire(rule.id, sensor_id, now) {
                debug!(
                    rule_id = rule.id,
                    sensor_id,
                    stage = %PipelineStage::Suppressed,
                    "Within cooldown"
                );
                outcome.suppressed.push(rule.id);
                continue;
            }

            let notification = build_notification(&rule, &result, sensor, now);
            if let Err(e) = with_timeout(
                "database",
                self.io_timeout,
                self.repo.save_notification(&notification),
            )
            .await
            {
                warn!(rule_id = rule.id, sensor_id, error = %e, "Failed to save notification");
            }
            self.publish(PipelineEvent::Alert {
                notification: notification.clone(),
            })
            .await;

            info!(
                rule_id = rule.id,
                sensor_id,
                severity = %result.severity,
                stage = %PipelineStage::Notified,
                "{}",
                notification.title
            );
            outcome.notifications.push(notification);
        }

        debug!(
            sensor_id,
            notified = outcome.notifications.len(),
            suppressed = outcome.suppressed.len(),
            stage = %PipelineStage::Done
        );
        outcome
    }

    async fn publish(&self, event: PipelineEvent) {
        // ---
        let kind = event.kind();
        let publish = self.sink.publish(event);
        if let Err(e) = with_timeout("fan-out sink", self.io_timeout, publish).await {
            warn!(event = kind, error = %e, "Fan-out publish failed, event dropped");
        }
    }
}

/// AQI for every present pollutant; a failing pollutant is logged and left out.
pub fn compute_all_aqi(reading: &Reading) -> Vec<AqiResult> {
    // ---
    reading
        .concentrations
        .present()
        .filter_map(|(pollutant, value)| match compute_aqi(pollutant, value) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    sensor_id = %reading.sensor_id,
                    pollutant = %pollutant,
                    error = %e,
                    "AQI computation failed"
                );
                None
            }
        })
        .collect()
}

fn build_notification(
    rule: &AlertRule,
    result: &MatchResult,
    sensor: &Sensor,
    now: DateTime<Utc>,
) -> Notification {
    // ---
    let pollutant = rule.pollutant;
    let observed = result.observed_value.unwrap_or_default();
    let title = format!(
        "{} {} alert: {}",
        result.severity.to_string().to_uppercase(),
        pollutant.label(),
        rule.name
    );
    let message = format!(
        "{} reading of {:.1} {} at {} is {} your threshold of {} {}",
        pollutant.label(),
        observed,
        pollutant.unit(),
        sensor.name,
        rule.operator.phrase(),
        rule.threshold,
        pollutant.unit()
    );
    let channels = if rule.channels.is_empty() {
        vec![Channel::InApp]
    } else {
        rule.channels.clone()
    };

    Notification {
        id: Uuid::new_v4(),
        user_id: rule.user_id,
        rule_id: Some(rule.id),
        kind: NotificationKind::Alert,
        title,
        message,
        channels,
        read: false,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::dedup::{DedupConfig, ManualClock};
    use crate::error::CoreError;
    use crate::models::{ComparisonOperator, Concentrations, NewAlertRule, Pollutant, SensorStatus};
    use crate::store::{MemoryRepository, ReadingFilter};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    // Sink that remembers what it was given
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<PipelineEvent>>,
    }

    #[async_trait]
    impl FanoutSink for RecordingSink {
        async fn publish(&self, event: PipelineEvent) -> Result<(), CoreError> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct StalledSink;

    #[async_trait]
    impl FanoutSink for StalledSink {
        async fn publish(&self, _event: PipelineEvent) -> Result<(), CoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    /// Serves rules from an inner memory store but refuses every write.
    struct ReadOnlyRepository {
        inner: MemoryRepository,
    }

    #[async_trait]
    impl Repository for ReadOnlyRepository {
        async fn list_sensors(&self) -> Result<Vec<Sensor>, CoreError> {
            self.inner.list_sensors().await
        }
        async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, CoreError> {
            self.inner.get_sensor(id).await
        }
        async fn upsert_sensor(&self, _sensor: &Sensor) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn list_active_rules(&self) -> Result<Vec<AlertRule>, CoreError> {
            self.inner.list_active_rules().await
        }
        async fn insert_rule(&self, _rule: NewAlertRule) -> Result<AlertRule, CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn set_rule_active(&self, _rule_id: i64, _active: bool) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn query_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError> {
            self.inner.query_readings(filter).await
        }
        async fn insert_reading(&self, _reading: &Reading) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn save_notification(&self, _n: &Notification) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn list_notifications(
            &self,
            _user_id: i64,
            _limit: usize,
        ) -> Result<Vec<Notification>, CoreError> {
            Ok(Vec::new())
        }
        async fn insert_sensor(&self, _sensor: &Sensor) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn update_sensor(&self, _sensor: &Sensor) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn delete_sensor(&self, _id: &str) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn list_rules(&self, user_id: i64) -> Result<Vec<AlertRule>, CoreError> {
            self.inner.list_rules(user_id).await
        }
        async fn update_rule(&self, _rule: &AlertRule) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn delete_rule(&self, _rule_id: i64, _user_id: i64) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
        async fn mark_notification_read(&self, _id: Uuid, _user_id: i64) -> Result<(), CoreError> {
            Err(CoreError::unavailable("database", "read only"))
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn create_test_sensor() -> Sensor {
        Sensor {
            id: "S1".to_string(),
            name: "Downtown Station".to_string(),
            latitude: 40.7128,
            longitude: -74.0060,
            status: SensorStatus::Active,
            battery_level: 90,
        }
    }

    fn create_test_rule(pollutant: Pollutant, threshold: f64) -> NewAlertRule {
        NewAlertRule {
            user_id: 1,
            name: format!("{} watch", pollutant.label()),
            pollutant,
            operator: ComparisonOperator::GreaterThan,
            threshold,
            location_filter: None,
            channels: vec![Channel::Email],
            is_active: true,
        }
    }

    fn create_test_reading(pm25: f64) -> Reading {
        Reading::new(
            "S1",
            start_time(),
            Concentrations {
                pm25: Some(pm25),
                pm10: Some(pm25 * 1.6),
                ..Default::default()
            },
        )
    }

    fn build_pipeline(
        repo: Arc<dyn Repository>,
        sink: Arc<dyn FanoutSink>,
        clock: ManualClock,
        io_timeout: Duration,
    ) -> AlertPipeline {
        let dedup = Arc::new(Deduplicator::new(DedupConfig::default()));
        AlertPipeline::new(repo, sink, dedup, Arc::new(clock), io_timeout)
    }

    #[tokio::test]
    async fn test_matching_rule_notifies_and_persists() {
        // ---
        let repo = Arc::new(MemoryRepository::new());
        repo.insert_rule(create_test_rule(Pollutant::Pm25, 35.0)).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let pipeline = build_pipeline(
            repo.clone(),
            sink.clone(),
            ManualClock::new(start_time()),
            Duration::from_secs(1),
        );

        let outcome = pipeline.process(create_test_reading(40.0), &create_test_sensor()).await;

        assert_eq!(outcome.notifications.len(), 1);
        let n = &outcome.notifications[0];
        assert_eq!(n.title, "MEDIUM PM2.5 alert: PM2.5 watch");
        assert!(n.message.contains("40.0 µg/m³"));
        assert!(n.message.contains("Downtown Station"));
        assert_eq!(n.rule_id, Some(1));
        assert_eq!(outcome.enriched.aqi.len(), 2);

        assert_eq!(repo.reading_count(), 1);
        assert_eq!(repo.list_notifications(1, 10).await.unwrap().len(), 1);

        let kinds: Vec<&str> = sink.events.lock().iter().map(PipelineEvent::kind).collect();
        assert_eq!(kinds, vec!["sensor_data", "alert"]);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_fire() {
        // ---
        let repo = Arc::new(MemoryRepository::new());
        let rule = repo.insert_rule(create_test_rule(Pollutant::Pm25, 35.0)).await.unwrap();
        let clock = ManualClock::new(start_time());
        let pipeline = build_pipeline(
            repo,
            Arc::new(RecordingSink::default()),
            clock.clone(),
            Duration::from_secs(1),
        );
        let sensor = create_test_sensor();

        let first = pipeline.process(create_test_reading(40.0), &sensor).await;
        assert_eq!(first.notifications.len(), 1);

        clock.advance(Duration::from_secs(2));
        let second = pipeline.process(create_test_reading(41.0), &sensor).await;
        assert!(second.notifications.is_empty());
        assert_eq!(second.suppressed, vec![rule.id]);

        clock.advance(Duration::from_secs(28));
        let third = pipeline.process(create_test_reading(42.0), &sensor).await;
        assert_eq!(third.notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_pollutant_is_silent() {
        // ---
        let repo = Arc::new(MemoryRepository::new());
        repo.insert_rule(create_test_rule(Pollutant::No2, 10.0)).await.unwrap();
        let pipeline = build_pipeline(
            repo,
            Arc::new(RecordingSink::default()),
            ManualClock::new(start_time()),
            Duration::from_secs(1),
        );

        let outcome = pipeline.process(create_test_reading(80.0), &create_test_sensor()).await;
        assert!(outcome.notifications.is_empty());
        assert!(outcome.suppressed.is_empty());
        assert_eq!(outcome.rule_failures, 0);
    }

    #[tokio::test]
    async fn test_bad_rule_does_not_block_others() {
        // ---
        let repo = Arc::new(MemoryRepository::new());
        repo.insert_rule(create_test_rule(Pollutant::Pm25, f64::NAN)).await.unwrap();
        repo.insert_rule(create_test_rule(Pollutant::Pm10, 50.0)).await.unwrap();
        let pipeline = build_pipeline(
            repo,
            Arc::new(RecordingSink::default()),
            ManualClock::new(start_time()),
            Duration::from_secs(1),
        );

        let outcome = pipeline.process(create_test_reading(40.0), &create_test_sensor()).await;
        assert_eq!(outcome.rule_failures, 1);
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].rule_id, Some(2));
    }

    #[tokio::test]
    async fn test_inactive_rule_never_fires() {
        // ---
        let repo = Arc::new(MemoryRepository::new());
        let mut rule = create_test_rule(Pollutant::Pm25, 35.0);
        rule.is_active = false;
        repo.insert_rule(rule).await.unwrap();
        let pipeline = build_pipeline(
            repo,
            Arc::new(RecordingSink::default()),
            ManualClock::new(start_time()),
            Duration::from_secs(1),
        );

        let outcome = pipeline.process(create_test_reading(99.0), &create_test_sensor()).await;
        assert!(outcome.notifications.is_empty());
    }

    #[tokio::test]
    async fn test_failed_writes_still_return_notifications() {
        // ---
        let inner = MemoryRepository::new();
        inner.insert_rule(create_test_rule(Pollutant::Pm25, 35.0)).await.unwrap();
        let repo = Arc::new(ReadOnlyRepository { inner });
        let pipeline = build_pipeline(
            repo,
            Arc::new(RecordingSink::default()),
            ManualClock::new(start_time()),
            Duration::from_secs(1),
        );

        let outcome = pipeline.process(create_test_reading(60.0), &create_test_sensor()).await;
        assert_eq!(outcome.notifications.len(), 1);
        assert!(outcome.notifications[0].title.starts_with("HIGH"));
    }

    #[tokio::test]
    async fn test_stalled_sink_times_out() {
        // ---
        let repo = Arc::new(MemoryRepository::new());
        repo.insert_rule(create_test_rule(Pollutant::Pm25, 35.0)).await.unwrap();
        let pipeline = build_pipeline(
            repo.clone(),
            Arc::new(StalledSink),
            ManualClock::new(start_time()),
            Duration::from_millis(20),
        );

        let started = std::time::Instant::now();
        let outcome = pipeline.process(create_test_reading(40.0), &create_test_sensor()).await;

        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(repo.list_notifications(1, 10).await.unwrap().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
