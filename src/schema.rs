//! Database schema management for `fieldpulse`.
//!
//! Ensures the reading, job and cache tables exist before either binary
//! starts serving. Both the API server and standalone workers call
//! [`create_schema`] on startup, so the DDL runs under a transaction-scoped
//! advisory lock.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Arbitrary key for `pg_advisory_xact_lock`; serializes concurrent
/// startups of several processes against the same database.
const SCHEMA_LOCK_ID: i64 = 0x6669_656c_6470_756c;

/// Create the database schema (idempotent).
///
/// Creates `sensor_readings`, `analytics_jobs` and `result_cache` together
/// with the indexes used by the read paths and the claim query. Safe to call
/// on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_ID)
        .execute(&mut *tx)
        .await?;

    // Current upload; replaced wholesale by every ingest
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id             BIGSERIAL PRIMARY KEY,
            timestamp      TIMESTAMPTZ      NOT NULL,
            field_id       TEXT             NOT NULL CHECK (field_id <> ''),
            sensor_type    TEXT             NOT NULL CHECK (sensor_type IN (
                               'soil_moisture', 'temperature', 'humidity', 'ph',
                               'sunlight', 'rainfall', 'wind_speed', 'soil_nitrogen')),
            reading_value  DOUBLE PRECISION NOT NULL,
            unit           TEXT             NOT NULL CHECK (unit <> '')
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analytics_jobs (
            id              UUID        PRIMARY KEY,
            kind            TEXT        NOT NULL,
            payload         JSONB       NOT NULL DEFAULT '{}'::jsonb,
            state           TEXT        NOT NULL CHECK (state IN (
                                'pending', 'active', 'completed', 'failed')),
            attempts        INTEGER     NOT NULL DEFAULT 0,
            max_attempts    INTEGER     NOT NULL,
            run_at          TIMESTAMPTZ NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            lease_id        UUID,
            locked_until    TIMESTAMPTZ,
            keep_completed  INTEGER     NOT NULL,
            keep_failed     INTEGER     NOT NULL,
            last_error      TEXT,
            finished_at     TIMESTAMPTZ
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS result_cache (
            key         TEXT        PRIMARY KEY,
            value       JSONB       NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_sensor_readings_timestamp
            ON sensor_readings (timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_sensor_readings_field_type
            ON sensor_readings (field_id, sensor_type, timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_analytics_jobs_due
            ON analytics_jobs (state, run_at)",
        "CREATE INDEX IF NOT EXISTS idx_analytics_jobs_finished
            ON analytics_jobs (state, finished_at DESC)",
    ] {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::debug!("schema is up to date");
    Ok(())
}
