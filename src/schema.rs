//! Database schema management for `field-insights`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call per
//! database). Only additive `IF NOT EXISTS` statements live here.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the readings schema (idempotent).
///
/// Creates the `sensor_readings` table for raw readings and `daily_stats`
/// for the per-day rollups. Safe to call on every startup; no-op if objects
/// already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Raw readings, append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id            BIGSERIAL PRIMARY KEY,
            timestamp     TIMESTAMPTZ      NOT NULL,
            field_id      VARCHAR(50)      NOT NULL,
            sensor_type   VARCHAR(50)      NOT NULL,
            reading_value DOUBLE PRECISION NOT NULL,
            unit          VARCHAR(20)      NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One row per (date, field, sensor type); linked to readings by natural key only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_stats (
            id             BIGSERIAL PRIMARY KEY,
            date           TIMESTAMPTZ      NOT NULL,
            field_id       VARCHAR(50)      NOT NULL,
            sensor_type    VARCHAR(50)      NOT NULL,
            avg_value      DOUBLE PRECISION NOT NULL,
            min_value      DOUBLE PRECISION NOT NULL,
            max_value      DOUBLE PRECISION NOT NULL,
            count_readings BIGINT           NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_sensor_readings_timestamp ON sensor_readings (timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_sensor_readings_field_id ON sensor_readings (field_id)",
        "CREATE INDEX IF NOT EXISTS idx_sensor_readings_sensor_type ON sensor_readings (sensor_type)",
        "CREATE INDEX IF NOT EXISTS idx_sensor_readings_field_sensor ON sensor_readings (field_id, sensor_type)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_daily_stats_natural_key ON daily_stats (date, field_id, sensor_type)",
        "CREATE INDEX IF NOT EXISTS idx_daily_stats_date ON daily_stats (date)",
    ] {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Create the task queue table in the broker database (idempotent).
pub async fn create_queue_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deferred_tasks (
            id         UUID PRIMARY KEY,
            kind       TEXT        NOT NULL,
            payload    JSONB       NOT NULL,
            status     TEXT        NOT NULL,
            progress   JSONB,
            result     JSONB,
            error      TEXT,
            attempts   INTEGER     NOT NULL DEFAULT 0,
            locked_at  TIMESTAMPTZ,
            dedup_key  TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Tables created before keyed submission existed
    sqlx::query("ALTER TABLE deferred_tasks ADD COLUMN IF NOT EXISTS dedup_key TEXT")
        .execute(&mut *tx)
        .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_deferred_tasks_status_created ON deferred_tasks (status, created_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_deferred_tasks_dedup_key ON deferred_tasks (dedup_key)",
        // At most one queued rollup per day; running ones are kept apart at claim time
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_deferred_tasks_pending_rollup \
            ON deferred_tasks ((payload->>'day')) \
            WHERE kind = 'daily_rollup' AND status = 'pending'",
    ] {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Pool on the scratch database named by `TEST_DATABASE_URL`, schema applied.
///
/// The tests using it share the queue table; run them with
/// `cargo test -- --ignored --test-threads=1`.
#[cfg(test)]
pub(crate) async fn test_pool() -> PgPool {
    // ---
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to TEST_DATABASE_URL");
    create_schema(&pool).await.expect("create schema");
    create_queue_schema(&pool).await.expect("create queue schema");
    pool
}
