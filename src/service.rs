//! Query surface consumed by the HTTP layer.
//!
//! [`AirQualityService`] wraps the repository, the pipeline and the fan-out
//! sink behind the handful of operations the reporting/UI layer needs. Inputs
//! arrive in their loosely-typed wire form and are validated here, so
//! `InvalidInput` is reported before anything reaches the pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate, AggregateBucket, AggregateFilter, Granularity};
use crate::aqi::{compute_aqi, AqiResult};
use crate::compliance::{compliance_report, ComplianceReport};
use crate::error::{with_timeout, CoreError};
use crate::models::{
    AlertRule, AlertRuleDraft, Channel, Notification, Pollutant, RawReading, Reading, Sensor,
    SensorDraft, SensorOverview,
};
use crate::pipeline::{AlertPipeline, PipelineOutcome};
use crate::rules::{evaluate, MatchResult};
use crate::sink::{FanoutSink, PipelineEvent};
use crate::store::{ReadingFilter, Repository};

// ---

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;
pub const MAX_COMPLIANCE_DAYS: u32 = 366;
pub const DEFAULT_HISTORICAL_LIMIT: usize = 1000;
pub const MAX_HISTORICAL_LIMIT: usize = 10_000;

/// Window for a raw reading history query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryWindow {
    pub sensor_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub struct AirQualityService {
    repo: Arc<dyn Repository>,
    pipeline: Arc<AlertPipeline>,
    sink: Arc<dyn FanoutSink>,
    io_timeout: Duration,
}

impl AirQualityService {
    // ---
    pub fn new(
        repo: Arc<dyn Repository>,
        pipeline: Arc<AlertPipeline>,
        sink: Arc<dyn FanoutSink>,
        io_timeout: Duration,
    ) -> Self {
        AirQualityService {
            repo,
            pipeline,
            sink,
            io_timeout,
        }
    }

    pub fn get_aqi(
        &self,
        pollutant: Pollutant,
        concentration: f64,
    ) -> Result<AqiResult, CoreError> {
        compute_aqi(pollutant, concentration)
    }

    /// Resolve a sensor id, treating an unknown id as bad input.
    pub async fn resolve_sensor(&self, sensor_id: &str) -> Result<Sensor, CoreError> {
        // ---
        with_timeout("database", self.io_timeout, self.repo.get_sensor(sensor_id))
            .await?
            .ok_or_else(|| CoreError::invalid(format!("unknown sensor '{sensor_id}'")))
    }

    /// Dry run of the matcher over every active rule. Nothing is deduplicated,
    /// persisted or published. Rules that fail to evaluate are left out.
    pub async fn evaluate_alerts(
        &self,
        reading: &Reading,
        sensor: &Sensor,
    ) -> Result<Vec<MatchResult>, CoreError> {
        // ---
        let rules =
            with_timeout("database", self.io_timeout, self.repo.list_active_rules()).await?;

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules.iter().filter(|r| r.is_active) {
            match evaluate(rule, reading, sensor) {
                Ok(result) => results.push(result),
                Err(e) => warn!(
                    rule_id = rule.id,
                    sensor_id = %sensor.id,
                    error = %e,
                    "Skipping rule in dry run"
                ),
            }
        }
        Ok(results)
    }

    pub async fn get_aggregates(
        &self,
        filter: &AggregateFilter,
    ) -> Result<Vec<AggregateBucket>, CoreError> {
        // ---
        let readings = with_timeout(
            "database",
            self.io_timeout,
            self.repo.query_readings(&filter.reading_filter()),
        )
        .await?;
        Ok(aggregate(&readings, filter))
    }

    pub async fn get_latest_per_sensor(&self) -> Result<Vec<Reading>, CoreError> {
        with_timeout("database", self.io_timeout, self.repo.latest_readings()).await
    }

    /// Validate a raw reading and run it through the pipeline.
    pub async fn submit_reading(&self, raw: RawReading) -> Result<PipelineOutcome, CoreError> {
        // ---
        let reading = raw.into_reading()?;
        let sensor = self.resolve_sensor(&reading.sensor_id).await?;
        Ok(self.pipeline.process(reading, &sensor).await)
    }

    /// Raw readings, newest first. Defaults to the last
    /// [`DEFAULT_HISTORICAL_LIMIT`] readings.
    pub async fn historical_readings(
        &self,
        window: HistoryWindow,
    ) -> Result<Vec<Reading>, CoreError> {
        // ---
        if let (Some(start), Some(end)) = (window.start, window.end) {
            if start > end {
                return Err(CoreError::invalid("start must not be after end"));
            }
        }
        let filter = ReadingFilter {
            sensor_id: window.sensor_id.filter(|s| !s.is_empty()),
            start: window.start,
            end: window.end,
            limit: Some(
                window
                    .limit
                    .unwrap_or(DEFAULT_HISTORICAL_LIMIT)
                    .clamp(1, MAX_HISTORICAL_LIMIT),
            ),
            newest_first: true,
        };
        with_timeout("database", self.io_timeout, self.repo.query_readings(&filter)).await
    }

    // ---

    pub async fn list_sensors(&self) -> Result<Vec<Sensor>, CoreError> {
        with_timeout("database", self.io_timeout, self.repo.list_sensors()).await
    }

    pub async fn get_sensor(&self, id: &str) -> Result<Sensor, CoreError> {
        with_timeout("database", self.io_timeout, self.repo.get_sensor(id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("sensor {id}")))
    }

    /// Add a sensor to the fleet. The ingestion loop picks it up on its next
    /// tick when it is active.
    pub async fn register_sensor(&self, draft: SensorDraft) -> Result<Sensor, CoreError> {
        // ---
        let sensor = draft.validate()?;
        with_timeout("database", self.io_timeout, self.repo.insert_sensor(&sensor)).await?;
        info!(sensor_id = %sensor.id, "Registered sensor '{}'", sensor.name);
        Ok(sensor)
    }

    pub async fn update_sensor(
        &self,
        id: &str,
        mut draft: SensorDraft,
    ) -> Result<Sensor, CoreError> {
        // ---
        draft.id = id.to_string();
        let sensor = draft.validate()?;
        with_timeout("database", self.io_timeout, self.repo.update_sensor(&sensor)).await?;
        info!(sensor_id = %sensor.id, status = sensor.status.as_str(), "Updated sensor");
        Ok(sensor)
    }

    /// Only sensors without readings can be removed; retire the others by
    /// setting their status to `offline`.
    pub async fn delete_sensor(&self, id: &str) -> Result<(), CoreError> {
        // ---
        with_timeout("database", self.io_timeout, self.repo.delete_sensor(id)).await?;
        info!(sensor_id = id, "Deleted sensor");
        Ok(())
    }

    /// Every sensor with its reading count for the current UTC day.
    pub async fn sensor_overview(&self) -> Result<Vec<SensorOverview>, CoreError> {
        // ---
        let today = Granularity::Day.bucket_start(self.pipeline.now());
        let sensors = self.list_sensors().await?;
        let counts = self.repo.reading_counts_since(today);
        let counts = with_timeout("database", self.io_timeout, counts).await?;

        Ok(sensors
            .into_iter()
            .map(|sensor| SensorOverview {
                data_points_today: counts.get(&sensor.id).copied().unwrap_or(0),
                sensor,
            })
            .collect())
    }

    // ---

    pub async fn list_rules(&self, user_id: i64) -> Result<Vec<AlertRule>, CoreError> {
        with_timeout("database", self.io_timeout, self.repo.list_rules(user_id)).await
    }

    pub async fn create_rule(&self, draft: AlertRuleDraft) -> Result<AlertRule, CoreError> {
        // ---
        let rule = draft.validate()?;
        let rule = with_timeout("database", self.io_timeout, self.repo.insert_rule(rule)).await?;
        info!(rule_id = rule.id, user_id = rule.user_id, "Created alert rule '{}'", rule.name);
        Ok(rule)
    }

    /// Replace a rule with a new definition. The draft's `user_id` must own
    /// the rule.
    pub async fn update_rule(
        &self,
        rule_id: i64,
        draft: AlertRuleDraft,
    ) -> Result<AlertRule, CoreError> {
        // ---
        let rule = draft.validate()?.with_id(rule_id);
        with_timeout("database", self.io_timeout, self.repo.update_rule(&rule)).await?;
        info!(rule_id, user_id = rule.user_id, "Updated alert rule '{}'", rule.name);
        Ok(rule)
    }

    pub async fn delete_rule(&self, rule_id: i64, user_id: i64) -> Result<(), CoreError> {
        // ---
        with_timeout("database", self.io_timeout, self.repo.delete_rule(rule_id, user_id)).await?;
        info!(rule_id, user_id, "Deleted alert rule");
        Ok(())
    }

    pub async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), CoreError> {
        with_timeout("database", self.io_timeout, self.repo.set_rule_active(rule_id, active)).await
    }

    /// Manual/test notification. Persisted and published like an alert, but
    /// with no originating rule.
    pub async fn send_manual_notification(
        &self,
        user_id: i64,
        title: &str,
        message: &str,
        channels: &[String],
    ) -> Result<Notification, CoreError> {
        // ---
        if title.trim().is_empty() {
            return Err(CoreError::invalid("notification title is required"));
        }
        let channels = channels
            .iter()
            .map(|c| c.parse::<Channel>())
            .collect::<Result<Vec<_>, _>>()?;

        let now = self.pipeline.now();
        let notification = Notification::manual(user_id, title.trim(), message, channels, now);
        let save = self.repo.save_notification(&notification);
        with_timeout("database", self.io_timeout, save).await?;

        let event = PipelineEvent::Alert {
            notification: notification.clone(),
        };
        let publish = self.sink.publish(event);
        if let Err(e) = with_timeout("fan-out sink", self.io_timeout, publish).await {
            warn!(user_id, error = %e, "Failed to publish manual notification");
        }
        Ok(notification)
    }

    pub async fn notification_history(
        &self,
        user_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Notification>, CoreError> {
        // ---
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        let listed = self.repo.list_notifications(user_id, limit);
        with_timeout("database", self.io_timeout, listed).await
    }

    pub async fn mark_notification_read(&self, id: Uuid, user_id: i64) -> Result<(), CoreError> {
        let marked = self.repo.mark_notification_read(id, user_id);
        with_timeout("database", self.io_timeout, marked).await
    }

    pub async fn compliance(&self, days: u32) -> Result<ComplianceReport, CoreError> {
        // ---
        let days = days.clamp(1, MAX_COMPLIANCE_DAYS);
        let now = self.pipeline.now();
        let mut filter = ReadingFilter::since(now - chrono::Duration::days(i64::from(days)));
        filter.end = Some(now);

        let readings =
            with_timeout("database", self.io_timeout, self.repo.query_readings(&filter)).await?;
        Ok(compliance_report(&readings, now, days))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::aggregate::Granularity;
    use crate::dedup::{DedupConfig, Deduplicator, ManualClock};
    use crate::models::NotificationKind;
    use crate::sink::BroadcastSink;
    use crate::store::MemoryRepository;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio_test::{assert_err, assert_ok};

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 3, 14, 0, 0).unwrap()
    }

    fn build_service() -> (AirQualityService, ManualClock, BroadcastSink) {
        // ---
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::seeded_demo());
        let sink = BroadcastSink::new(32);
        let clock = ManualClock::new(start_time());
        let pipeline = Arc::new(AlertPipeline::new(
            repo.clone(),
            Arc::new(sink.clone()),
            Arc::new(Deduplicator::new(DedupConfig::default())),
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        ));
        let service =
            AirQualityService::new(repo, pipeline, Arc::new(sink.clone()), Duration::from_secs(1));
        (service, clock, sink)
    }

    fn create_test_raw(sensor_id: &str, minutes: i64, pm25: f64) -> RawReading {
        serde_json::from_value(serde_json::json!({
            "sensor_id": sensor_id,
            "timestamp": (start_time() + chrono::Duration::minutes(minutes)).to_rfc3339(),
            "pm25": pm25,
        }))
        .unwrap()
    }

    fn create_test_draft(pollutant: &str, location: Option<&str>) -> AlertRuleDraft {
        AlertRuleDraft {
            user_id: 7,
            name: "watch".to_string(),
            pollutant_type: pollutant.to_string(),
            comparison_operator: "greater_than".to_string(),
            threshold_value: Some(30.0),
            location_filter: location.map(String::from),
            notification_channels: vec!["sms".to_string()],
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_submit_reading_runs_pipeline() {
        // ---
        let (service, _clock, _sink) = build_service();

        let outcome = service.submit_reading(create_test_raw("sensor_001", 0, 40.0)).await.unwrap();
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.enriched.aqi[0].index, 112);

        let history = service.notification_history(1, None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_reading_rejects_unknown_sensor_and_bad_values() {
        // ---
        let (service, _clock, _sink) = build_service();

        let unknown = service.submit_reading(create_test_raw("sensor_999", 0, 10.0)).await;
        assert!(matches!(unknown, Err(CoreError::InvalidInput(_))));

        let negative = service.submit_reading(create_test_raw("sensor_001", 0, -3.0)).await;
        assert!(matches!(negative, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_emit() {
        // ---
        let (service, _clock, _sink) = build_service();
        let reading = create_test_raw("sensor_002", 0, 60.0).into_reading().unwrap();
        let sensor = service.resolve_sensor("sensor_002").await.unwrap();

        let results = service.evaluate_alerts(&reading, &sensor).await.unwrap();
        // Two seeded rules: PM2.5 matches, PM10 has no data
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.matched).count(), 1);
        assert!(service.notification_history(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rule_lifecycle_and_location_filter() {
        // ---
        let (service, _clock, _sink) = build_service();
        let draft = create_test_draft("pm25", Some("industrial"));
        let rule = service.create_rule(draft).await.unwrap();
        assert_eq!(rule.channels, vec![Channel::Sms]);

        let raw = create_test_raw("sensor_001", 0, 33.0);
        let downtown = service.submit_reading(raw).await.unwrap();
        assert!(downtown.notifications.is_empty());

        let raw = create_test_raw("sensor_002", 0, 33.0);
        let industrial = service.submit_reading(raw).await.unwrap();
        assert_eq!(industrial.notifications.len(), 1);
        assert_eq!(industrial.notifications[0].user_id, 7);

        assert_ok!(service.set_rule_active(rule.id, false).await);
        assert!(matches!(
            service.set_rule_active(4242, true).await,
            Err(CoreError::NotFound(_))
        ));
        assert_err!(service.create_rule(create_test_draft("radon", None)).await);
    }

    #[tokio::test]
    async fn test_aggregates_over_submitted_readings() {
        // ---
        let (service, _clock, _sink) = build_service();
        for (minutes, pm25) in [(1, 10.0), (2, 20.0), (3, 30.0)] {
            service.submit_reading(create_test_raw("sensor_005", minutes, pm25)).await.unwrap();
        }

        let mut filter = AggregateFilter::new(Pollutant::Pm25, Granularity::Hour);
        filter.sensor_id = Some("sensor_005".to_string());
        let buckets = service.get_aggregates(&filter).await.unwrap();

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].time_period, "2025-09-03 14:00:00");
        assert_eq!(buckets[0].avg_value, 20.0);
        assert_eq!(buckets[0].data_points, 3);

        let latest = service.get_latest_per_sensor().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].concentrations.pm25, Some(30.0));
    }

    #[tokio::test]
    async fn test_manual_notification_is_saved_and_published() {
        // ---
        let (service, _clock, sink) = build_service();
        let mut events = sink.subscribe();

        let n = service
            .send_manual_notification(3, "Test", "hello from ops", &[])
            .await
            .unwrap();
        assert_eq!(n.kind, NotificationKind::Manual);
        assert_eq!(n.channels, vec![Channel::InApp]);

        assert_eq!(events.recv().await.unwrap().kind(), "alert");
        assert_eq!(service.notification_history(3, Some(10)).await.unwrap().len(), 1);

        assert_err!(service.send_manual_notification(3, "  ", "x", &[]).await);
        assert_err!(
            service
                .send_manual_notification(3, "t", "x", &["carrier pigeon".to_string()])
                .await
        );
    }

    #[tokio::test]
    async fn test_compliance_uses_clock_window() {
        // ---
        let (service, clock, _sink) = build_service();
        service.submit_reading(create_test_raw("sensor_001", 0, 50.0)).await.unwrap();
        clock.advance(Duration::from_secs(3600));

        let report = service.compliance(7).await.unwrap();
        let pm25 = report.pollutants.iter().find(|p| p.pollutant == "PM2.5").unwrap();
        assert_eq!(pm25.violations_this_period, 1);
        assert_eq!(report.total_standards, 6);
    }

    fn create_test_sensor_draft(id: &str) -> SensorDraft {
        SensorDraft {
            id: id.to_string(),
            name: "Ferry Terminal".to_string(),
            latitude: 40.70,
            longitude: -74.01,
            status: None,
            battery_level: Some(90),
        }
    }

    #[tokio::test]
    async fn test_registered_sensor_accepts_readings() {
        // ---
        let (service, _clock, _sink) = build_service();
        assert!(service.submit_reading(create_test_raw("sensor_100", 0, 40.0)).await.is_err());

        let sensor = service.register_sensor(create_test_sensor_draft("sensor_100")).await.unwrap();
        assert_eq!(sensor.battery_level, 90);
        assert!(matches!(
            service.register_sensor(create_test_sensor_draft("sensor_100")).await,
            Err(CoreError::Conflict(_))
        ));

        let outcome = service.submit_reading(create_test_raw("sensor_100", 0, 40.0)).await.unwrap();
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(service.list_sensors().await.unwrap().len(), 11);

        // Readings pin the sensor; it can only be retired
        assert!(matches!(service.delete_sensor("sensor_100").await, Err(CoreError::Conflict(_))));
        let mut retire = create_test_sensor_draft("ignored");
        retire.status = Some("offline".to_string());
        let retired = service.update_sensor("sensor_100", retire).await.unwrap();
        assert_eq!(retired.id, "sensor_100");
        assert_eq!(service.get_sensor("sensor_100").await.unwrap().status, retired.status);

        assert!(matches!(service.get_sensor("sensor_404").await, Err(CoreError::NotFound(_))));
        assert_ok!(service.register_sensor(create_test_sensor_draft("sensor_101")).await);
        assert_ok!(service.delete_sensor("sensor_101").await);
    }

    #[tokio::test]
    async fn test_sensor_overview_counts_today() {
        // ---
        let (service, _clock, _sink) = build_service();
        // The day before the clock's current day does not count
        service.submit_reading(create_test_raw("sensor_004", -15 * 60, 5.0)).await.unwrap();
        service.submit_reading(create_test_raw("sensor_004", 1, 5.0)).await.unwrap();
        service.submit_reading(create_test_raw("sensor_004", 2, 5.0)).await.unwrap();

        let overview = service.sensor_overview().await.unwrap();
        assert_eq!(overview.len(), 10);
        let s4 = overview.iter().find(|o| o.sensor.id == "sensor_004").unwrap();
        assert_eq!(s4.data_points_today, 2);
        let s5 = overview.iter().find(|o| o.sensor.id == "sensor_005").unwrap();
        assert_eq!(s5.data_points_today, 0);
    }

    #[tokio::test]
    async fn test_rule_update_and_delete() {
        // ---
        let (service, _clock, _sink) = build_service();
        let rule = service.create_rule(create_test_draft("pm25", None)).await.unwrap();

        let mut raised = create_test_draft("pm25", None);
        raised.threshold_value = Some(80.0);
        let updated = service.update_rule(rule.id, raised).await.unwrap();
        assert_eq!(updated.threshold, 80.0);

        // 40 is now below user 7's threshold; only the seeded rule fires
        let outcome = service.submit_reading(create_test_raw("sensor_001", 0, 40.0)).await.unwrap();
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].user_id, 1);

        let mut stranger = create_test_draft("pm25", None);
        stranger.user_id = 8;
        assert!(matches!(
            service.update_rule(rule.id, stranger).await,
            Err(CoreError::NotFound(_))
        ));
        assert_err!(service.delete_rule(rule.id, 8).await);

        assert_eq!(service.list_rules(7).await.unwrap().len(), 1);
        assert_ok!(service.delete_rule(rule.id, 7).await);
        assert!(service.list_rules(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_historical_readings_newest_first() {
        // ---
        let (service, _clock, _sink) = build_service();
        for (minutes, pm25) in [(1, 10.0), (2, 20.0), (3, 30.0)] {
            service.submit_reading(create_test_raw("sensor_006", minutes, pm25)).await.unwrap();
        }
        service.submit_reading(create_test_raw("sensor_007", 4, 99.0)).await.unwrap();

        let window = HistoryWindow {
            sensor_id: Some("sensor_006".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let readings = service.historical_readings(window).await.unwrap();
        let values: Vec<f64> = readings.iter().filter_map(|r| r.concentrations.pm25).collect();
        assert_eq!(values, vec![30.0, 20.0]);

        let all = service.historical_readings(HistoryWindow::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let inverted = HistoryWindow {
            start: Some(start_time()),
            end: Some(start_time() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(matches!(
            service.historical_readings(inverted).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_notification_read() {
        // ---
        let (service, _clock, _sink) = build_service();
        let n = service.send_manual_notification(3, "Test", "hi", &[]).await.unwrap();

        assert_ok!(service.mark_notification_read(n.id, 3).await);
        assert!(service.notification_history(3, None).await.unwrap()[0].read);
        assert!(matches!(
            service.mark_notification_read(Uuid::new_v4(), 3).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
