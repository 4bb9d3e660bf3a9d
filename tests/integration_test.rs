use std::sync::Arc;
use std::time::Duration;

use airwatch_pipeline::{
    dedup::{DedupConfig, Deduplicator, SystemClock},
    routes::{self, AppState},
    sink::BroadcastSink,
    store::{MemoryRepository, Repository},
    AirQualityService, AlertPipeline,
};
use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

/// Serve the real router over the seeded in-memory store on an ephemeral port.
async fn spawn_app() -> Result<String> {
    // ---
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::seeded_demo());
    let events = BroadcastSink::new(64);
    let sink = Arc::new(events.clone());
    let pipeline = Arc::new(AlertPipeline::new(
        repo.clone(),
        sink.clone(),
        Arc::new(Deduplicator::new(DedupConfig::default())),
        Arc::new(SystemClock),
        Duration::from_secs(2),
    ));
    let service = Arc::new(AirQualityService::new(repo, pipeline, sink, Duration::from_secs(2)));
    let app = routes::router(AppState { service, events });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(format!("http://{}", addr))
}

#[tokio::test]
async fn health_and_aqi() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();

    let health: Value = client.get(format!("{}/health", base)).send().await?.json().await?;
    assert_eq!(health["status"], "ok");

    let aqi: Value = client
        .get(format!("{}/aqi?pollutant=pm25&concentration=35.4", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(aqi["index"], 100);
    assert_eq!(aqi["category"], "Moderate");
    assert_eq!(aqi["provisional"], false);

    let bad = client
        .get(format!("{}/aqi?pollutant=radon&concentration=1", base))
        .send()
        .await?;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn reading_fires_once_then_cooldown() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();
    let body = json!({
        "sensor_id": "sensor_001",
        "timestamp": "2025-03-01T10:15:00Z",
        "pm25": 40.0,
        "signal_strength": 88
    });

    let first = client.post(format!("{}/readings", base)).json(&body).send().await?;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: Value = first.json().await?;
    assert_eq!(first["notifications"].as_array().map(Vec::len), Some(1));
    assert!(first["notifications"][0]["title"]
        .as_str()
        .unwrap_or_default()
        .starts_with("MEDIUM PM2.5"));

    let second: Value = client
        .post(format!("{}/readings", base))
        .json(&body)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(second["notifications"].as_array().map(Vec::len), Some(0));
    assert_eq!(second["suppressed"].as_array().map(Vec::len), Some(1));

    let history: Value = client
        .get(format!("{}/notifications?user_id=1", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(history.as_array().map(Vec::len), Some(1));

    let unknown = client
        .post(format!("{}/readings", base))
        .json(&json!({ "sensor_id": "nope", "timestamp": "2025-03-01T10:15:00Z", "pm25": 1.0 }))
        .send()
        .await?;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn aggregate_and_latest() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();

    for (minute, pm25) in [(5, 10.0), (20, 20.0), (45, 30.0)] {
        let res = client
            .post(format!("{}/readings", base))
            .json(&json!({
                "sensor_id": "sensor_003",
                "timestamp": format!("2025-03-01T10:{:02}:00Z", minute),
                "pm25": pm25
            }))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let buckets: Value = client
        .get(format!(
            "{}/readings/aggregate?sensor_id=sensor_003&pollutant=pm25&interval=fortnight",
            base
        ))
        .send()
        .await?
        .json()
        .await?;
    let buckets = buckets.as_array().cloned().unwrap_or_default();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0]["time_period"], "2025-03-01 10:00:00");
    assert_eq!(buckets[0]["avg_value"], 20.0);
    assert_eq!(buckets[0]["min_value"], 10.0);
    assert_eq!(buckets[0]["max_value"], 30.0);
    assert_eq!(buckets[0]["data_points"], 3);

    let latest: Value = client
        .get(format!("{}/readings/latest", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(latest[0]["sensor_id"], "sensor_003");
    assert_eq!(latest[0]["pm25"], 30.0);

    Ok(())
}

#[tokio::test]
async fn rule_management_and_dry_run() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();

    let created = client
        .post(format!("{}/alerts", base))
        .json(&json!({
            "user_id": 5,
            "name": "Harbor ozone",
            "pollutant_type": "o3",
            "comparison_operator": "greater_than",
            "threshold_value": 70,
            "location_filter": "harbor",
            "notification_channels": ["email", "in_app"]
        }))
        .send()
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let rule: Value = created.json().await?;
    let id = rule["id"].as_i64().unwrap_or_default();
    assert_eq!(rule["pollutant"], "ozone");

    let results: Value = client
        .post(format!("{}/alerts/evaluate", base))
        .json(&json!({
            "reading": {
                "sensor_id": "sensor_007",
                "timestamp": "2025-03-01T10:00:00Z",
                "ozone": 90.0
            },
        }))
        .send()
        .await?
        .json()
        .await?;
    let matched: Vec<&Value> = results
        .as_array()
        .map(|r| r.iter().filter(|m| m["matched"] == true).collect())
        .unwrap_or_default();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0]["rule_id"], id);
    assert_eq!(matched[0]["severity"], "high");

    let toggled = client
        .put(format!("{}/alerts/{}/active", base, id))
        .json(&json!({ "is_active": false }))
        .send()
        .await?;
    assert_eq!(toggled.status(), StatusCode::OK);

    let missing = client
        .put(format!("{}/alerts/9999/active", base))
        .json(&json!({ "is_active": true }))
        .send()
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let invalid = client
        .post(format!("{}/alerts", base))
        .json(&json!({
            "user_id": 5,
            "name": "broken",
            "pollutant_type": "pm25",
            "comparison_operator": "about",
            "threshold_value": 1
        }))
        .send()
        .await?;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn manual_notification_and_compliance() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();

    let sent = client
        .post(format!("{}/notifications", base))
        .json(&json!({ "user_id": 9, "title": "Test", "message": "hello" }))
        .send()
        .await?;
    assert_eq!(sent.status(), StatusCode::CREATED);
    let sent: Value = sent.json().await?;
    assert_eq!(sent["kind"], "manual");
    assert_eq!(sent["channels"], json!(["in_app"]));

    let report: Value = client
        .get(format!("{}/compliance?days=7", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(report["total_standards"], 6);
    assert_eq!(report["pollutants"].as_array().map(Vec::len), Some(6));

    Ok(())
}

#[tokio::test]
async fn registered_sensor_accepts_readings() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();
    let reading = json!({
        "sensor_id": "sensor_100",
        "timestamp": "2025-03-01T10:15:00Z",
        "pm25": 12.0
    });

    let before = client.post(format!("{}/readings", base)).json(&reading).send().await?;
    assert_eq!(before.status(), StatusCode::BAD_REQUEST);

    let sensor = json!({
        "id": "sensor_100",
        "name": "Ferry Terminal",
        "latitude": 40.70,
        "longitude": -74.01
    });
    let created = client.post(format!("{}/sensors", base)).json(&sensor).send().await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let duplicate = client.post(format!("{}/sensors", base)).json(&sensor).send().await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let after = client.post(format!("{}/readings", base)).json(&reading).send().await?;
    assert_eq!(after.status(), StatusCode::CREATED);

    let fetched: Value = client
        .get(format!("{}/sensors/sensor_100", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(fetched["status"], "active");

    let retired = client
        .put(format!("{}/sensors/sensor_100", base))
        .json(&json!({
            "name": "Ferry Terminal",
            "latitude": 40.70,
            "longitude": -74.01,
            "status": "offline"
        }))
        .send()
        .await?;
    assert_eq!(retired.status(), StatusCode::OK);

    let pinned = client.delete(format!("{}/sensors/sensor_100", base)).send().await?;
    assert_eq!(pinned.status(), StatusCode::CONFLICT);

    let overview: Value = client
        .get(format!("{}/sensors/status", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(overview.as_array().map(Vec::len), Some(11));

    Ok(())
}

#[tokio::test]
async fn rule_update_delete_and_listing() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();
    let draft = json!({
        "user_id": 3,
        "name": "Campus NO2",
        "pollutant_type": "no2",
        "comparison_operator": "greater_than",
        "threshold_value": 100
    });

    let rule: Value = client
        .post(format!("{}/alerts", base))
        .json(&draft)
        .send()
        .await?
        .json()
        .await?;
    let id = rule["id"].as_i64().unwrap_or_default();

    let mut edited = draft.clone();
    edited["threshold_value"] = json!(150);
    let updated: Value = client
        .put(format!("{}/alerts/{}", base, id))
        .json(&edited)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(updated["threshold"], 150.0);

    let listed: Value = client
        .get(format!("{}/alerts?user_id=3", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let wrong_owner = client.delete(format!("{}/alerts/{}?user_id=4", base, id)).send().await?;
    assert_eq!(wrong_owner.status(), StatusCode::NOT_FOUND);
    let deleted = client.delete(format!("{}/alerts/{}?user_id=3", base, id)).send().await?;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let listed: Value = client
        .get(format!("{}/alerts?user_id=3", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(0));

    Ok(())
}

#[tokio::test]
async fn historical_readings_and_read_flag() -> Result<()> {
    // ---
    let base = spawn_app().await?;
    let client = Client::new();

    for minute in [5, 10, 15] {
        client
            .post(format!("{}/readings", base))
            .json(&json!({
                "sensor_id": "sensor_008",
                "timestamp": format!("2025-03-01T10:{:02}:00Z", minute),
                "pm25": 50.0 + minute as f64
            }))
            .send()
            .await?;
    }

    let history: Value = client
        .get(format!("{}/readings/historical?sensorId=sensor_008&limit=2", base))
        .send()
        .await?
        .json()
        .await?;
    let history = history.as_array().cloned().unwrap_or_default();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["pm25"], 65.0);
    assert_eq!(history[1]["pm25"], 60.0);

    let notifications: Value = client
        .get(format!("{}/notifications?user_id=1", base))
        .send()
        .await?
        .json()
        .await?;
    let id = notifications[0]["id"].as_str().unwrap_or_default().to_string();
    assert_eq!(notifications[0]["read"], false);

    let marked = client
        .put(format!("{}/notifications/{}/read", base, id))
        .json(&json!({ "user_id": 1 }))
        .send()
        .await?;
    assert_eq!(marked.status(), StatusCode::OK);

    let notifications: Value = client
        .get(format!("{}/notifications?user_id=1", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(notifications[0]["read"], true);

    Ok(())
}
