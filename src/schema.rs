//! Database schema management for `airwatch-pipeline`.
//!
//! Ensures required tables and indexes exist before the pipeline starts.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates `sensors`, the append-only `sensor_data` table, `alert_rules` and
/// `notifications`. Multi-valued channel columns hold a JSON list of channel
/// names as TEXT. Safe to call on every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensors (
            id                TEXT PRIMARY KEY,
            name              TEXT             NOT NULL,
            latitude          DOUBLE PRECISION NOT NULL,
            longitude         DOUBLE PRECISION NOT NULL,
            status            TEXT             NOT NULL DEFAULT 'active',
            battery_level     SMALLINT         NOT NULL DEFAULT 100,
            installation_date TIMESTAMPTZ      NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Raw readings, never updated in place
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_data (
            id             UUID PRIMARY KEY,
            sensor_id      TEXT        NOT NULL REFERENCES sensors (id),
            timestamp      TIMESTAMPTZ NOT NULL,
            pm25           DOUBLE PRECISION,
            pm10           DOUBLE PRECISION,
            ozone          DOUBLE PRECISION,
            co             DOUBLE PRECISION,
            no2            DOUBLE PRECISION,
            so2            DOUBLE PRECISION,
            temperature    DOUBLE PRECISION,
            humidity       DOUBLE PRECISION,
            wind_speed     DOUBLE PRECISION,
            wind_direction DOUBLE PRECISION
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_rules (
            id                    BIGSERIAL PRIMARY KEY,
            user_id               BIGINT           NOT NULL,
            name                  TEXT             NOT NULL,
            pollutant_type        TEXT             NOT NULL,
            threshold_value       DOUBLE PRECISION NOT NULL,
            comparison_operator   TEXT             NOT NULL,
            location_filter       TEXT,
            notification_channels TEXT             NOT NULL DEFAULT '[]',
            is_active             BOOLEAN          NOT NULL DEFAULT TRUE,
            created_at            TIMESTAMPTZ      NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id        UUID PRIMARY KEY,
            user_id   BIGINT      NOT NULL,
            alert_id  BIGINT      REFERENCES alert_rules (id) ON DELETE SET NULL,
            title     TEXT        NOT NULL,
            message   TEXT        NOT NULL,
            type      TEXT        NOT NULL DEFAULT 'alert',
            channels  TEXT        NOT NULL DEFAULT '[]',
            read      BOOLEAN     NOT NULL DEFAULT FALSE,
            timestamp TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Indexes for the time-window and latest-per-sensor queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_ts
            ON sensor_data (sensor_id, timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_data_ts
            ON sensor_data (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_notifications_user_ts
            ON notifications (user_id, timestamp DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
