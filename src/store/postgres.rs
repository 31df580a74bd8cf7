//! PostgreSQL implementation of the reading and rollup stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};

use super::{AnalyticsSnapshot, ClearedRows, DailyStatFilter, ReadingStore, RollupStore};
use crate::error::StoreError;
use crate::models::{
    DailyStat, GroupStats, NewDailyStat, NewReading, Page, Reading, ReadingFilter, TimeWindow,
};

// ---

/// Postgres caps a statement at 65535 bind parameters; five per row.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Append ` WHERE ...` for the reading filter; `column` is the timestamp column.
fn push_filters<'a>(
    qb: &mut QueryBuilder<'a, Postgres>,
    field_id: &'a Option<String>,
    sensor_type: &'a Option<String>,
    window: &'a TimeWindow,
    column: &str,
) {
    // ---
    qb.push(" WHERE TRUE");
    if let Some(field_id) = field_id {
        qb.push(" AND field_id = ").push_bind(field_id);
    }
    if let Some(sensor_type) = sensor_type {
        qb.push(" AND sensor_type = ").push_bind(sensor_type);
    }
    if let Some(start) = &window.start {
        qb.push(format!(" AND {column} >= ")).push_bind(start);
    }
    if let Some(end) = &window.end {
        qb.push(format!(" AND {column} < ")).push_bind(end);
    }
}

async fn fetch_readings<'c, E>(
    exec: E,
    filter: &ReadingFilter,
    page: Page,
) -> Result<Vec<Reading>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    // ---
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT id, timestamp, field_id, sensor_type, reading_value, unit FROM sensor_readings",
    );
    push_filters(
        &mut qb,
        &filter.field_id,
        &filter.sensor_type,
        &filter.window,
        "timestamp",
    );
    qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
        .push_bind(i64::from(page.limit))
        .push(" OFFSET ")
        .push_bind(i64::from(page.offset));

    qb.build_query_as::<Reading>().fetch_all(exec).await
}

async fn fetch_groups<'c, E>(exec: E, filter: &ReadingFilter) -> Result<Vec<GroupStats>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    // ---
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT
            field_id,
            sensor_type,
            COUNT(*)           AS count,
            SUM(reading_value) AS sum,
            MIN(reading_value) AS min,
            MAX(reading_value) AS max
        FROM sensor_readings
        "#,
    );
    push_filters(
        &mut qb,
        &filter.field_id,
        &filter.sensor_type,
        &filter.window,
        "timestamp",
    );
    qb.push(" GROUP BY field_id, sensor_type ORDER BY field_id, sensor_type");

    qb.build_query_as::<GroupStats>().fetch_all(exec).await
}

/// Whether any reading matches the filter's field and sensor type at any time.
async fn fetch_scope_seen<'c, E>(exec: E, filter: &ReadingFilter) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    // ---
    let any_time = TimeWindow::default();
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT EXISTS (SELECT 1 FROM sensor_readings");
    push_filters(
        &mut qb,
        &filter.field_id,
        &filter.sensor_type,
        &any_time,
        "timestamp",
    );
    qb.push(")");

    qb.build_query_scalar::<bool>().fetch_one(exec).await
}

#[async_trait]
impl ReadingStore for PgStore {
    // ---
    async fn insert(&self, reading: &NewReading) -> Result<Reading, StoreError> {
        // ---
        let row = sqlx::query_as::<_, Reading>(
            r#"
            INSERT INTO sensor_readings (timestamp, field_id, sensor_type, reading_value, unit)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, timestamp, field_id, sensor_type, reading_value, unit
            "#,
        )
        .bind(reading.timestamp)
        .bind(&reading.field_id)
        .bind(&reading.sensor_type)
        .bind(reading.reading_value)
        .bind(&reading.unit)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn bulk_insert(&self, readings: &[NewReading]) -> Result<Vec<i64>, StoreError> {
        // ---
        let mut ids = Vec::with_capacity(readings.len());
        if readings.is_empty() {
            return Ok(ids);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in readings.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensor_readings (timestamp, field_id, sensor_type, reading_value, unit) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(&r.field_id)
                    .push_bind(&r.sensor_type)
                    .push_bind(r.reading_value)
                    .push_bind(&r.unit);
            });
            qb.push(" RETURNING id");

            let chunk_ids = qb.build_query_scalar::<i64>().fetch_all(&mut *tx).await?;
            ids.extend(chunk_ids);
        }
        tx.commit().await?;

        tracing::debug!("Inserted {} readings", ids.len());
        Ok(ids)
    }

    async fn query_by_filters(
        &self,
        filter: &ReadingFilter,
        page: Page,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        Ok(fetch_readings(&self.pool, filter, page).await?)
    }

    async fn group_stats(&self, filter: &ReadingFilter) -> Result<Vec<GroupStats>, StoreError> {
        // ---
        Ok(fetch_groups(&self.pool, filter).await?)
    }

    async fn analytics_snapshot(
        &self,
        filter: &ReadingFilter,
        recent: u32,
    ) -> Result<AnalyticsSnapshot, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let groups = fetch_groups(&mut *tx, filter).await?;
        let matched = groups.iter().any(|g| g.count > 0);

        let recent = if matched && recent > 0 {
            let page = Page {
                limit: recent,
                offset: 0,
            };
            fetch_readings(&mut *tx, filter, page).await?
        } else {
            Vec::new()
        };

        let scope_seen = if matched {
            true
        } else if filter.window.is_unbounded() {
            false
        } else {
            fetch_scope_seen(&mut *tx, filter).await?
        };

        tx.commit().await?;
        Ok(AnalyticsSnapshot {
            groups,
            recent,
            scope_seen,
        })
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let result = sqlx::query("DELETE FROM sensor_readings WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self) -> Result<ClearedRows, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        let readings = sqlx::query("DELETE FROM sensor_readings")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let daily_stats = sqlx::query("DELETE FROM daily_stats")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(ClearedRows {
            readings,
            daily_stats,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        // ---
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RollupStore for PgStore {
    // ---
    async fn upsert_by_natural_key(
        &self,
        date: DateTime<Utc>,
        stats: &[NewDailyStat],
    ) -> Result<u64, StoreError> {
        // ---
        if let Some(stray) = stats.iter().find(|s| s.date != date) {
            return Err(StoreError::Corrupt(format!(
                "rollup bucket dated {} passed for {}",
                stray.date, date
            )));
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for stat in stats {
            let result = sqlx::query(
                r#"
                INSERT INTO daily_stats
                    (date, field_id, sensor_type, avg_value, min_value, max_value, count_readings)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (date, field_id, sensor_type) DO UPDATE SET
                    avg_value      = EXCLUDED.avg_value,
                    min_value      = EXCLUDED.min_value,
                    max_value      = EXCLUDED.max_value,
                    count_readings = EXCLUDED.count_readings
                "#,
            )
            .bind(stat.date)
            .bind(&stat.field_id)
            .bind(&stat.sensor_type)
            .bind(stat.avg_value)
            .bind(stat.min_value)
            .bind(stat.max_value)
            .bind(stat.count_readings)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        // Buckets whose readings are gone no longer belong to this day
        let field_ids: Vec<String> = stats.iter().map(|s| s.field_id.clone()).collect();
        let sensor_types: Vec<String> = stats.iter().map(|s| s.sensor_type.clone()).collect();
        let pruned = sqlx::query(
            r#"
            DELETE FROM daily_stats d
            WHERE d.date = $1
              AND NOT EXISTS (
                  SELECT 1
                  FROM UNNEST($2::text[], $3::text[]) AS k(field_id, sensor_type)
                  WHERE k.field_id = d.field_id AND k.sensor_type = d.sensor_type
              )
            "#,
        )
        .bind(date)
        .bind(&field_ids)
        .bind(&sensor_types)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Rollup for {}: {} bucket(s) written, {} stale bucket(s) removed",
            date,
            written,
            pruned.rows_affected()
        );
        Ok(written)
    }

    async fn list_daily_stats(
        &self,
        filter: &DailyStatFilter,
    ) -> Result<Vec<DailyStat>, StoreError> {
        // ---
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            SELECT id, date, field_id, sensor_type, avg_value, min_value, max_value, count_readings
            FROM daily_stats
            "#,
        );
        push_filters(
            &mut qb,
            &filter.field_id,
            &filter.sensor_type,
            &filter.window,
            "date",
        );
        qb.push(" ORDER BY date, field_id, sensor_type");

        let rows = qb.build_query_as::<DailyStat>().fetch_all(&self.pool).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::schema::test_pool;
    use crate::services::aggregation::{day_start, run_daily_rollup};
    use chrono::{Days, NaiveDate};
    use uuid::Uuid;

    /// A day no other run uses, so rollup rows of that date are ours alone.
    fn scratch_day() -> NaiveDate {
        let offset = (Uuid::new_v4().as_u128() % 36_500) as u64;
        NaiveDate::from_ymd_opt(1900, 1, 1).unwrap() + Days::new(offset)
    }

    fn reading(field_id: &str, at: DateTime<Utc>, value: f64) -> NewReading {
        NewReading {
            timestamp: at,
            field_id: field_id.to_string(),
            sensor_type: "temperature".to_string(),
            reading_value: value,
            unit: "celsius".to_string(),
        }
    }

    fn bucket(date: DateTime<Utc>, field_id: &str, avg: f64) -> NewDailyStat {
        NewDailyStat {
            date,
            field_id: field_id.to_string(),
            sensor_type: "temperature".to_string(),
            avg_value: avg,
            min_value: avg,
            max_value: avg,
            count_readings: 1,
        }
    }

    #[tokio::test]
    #[ignore = "requires a scratch PostgreSQL at TEST_DATABASE_URL"]
    async fn test_upsert_replaces_the_days_buckets() {
        // ---
        let store = PgStore::new(test_pool().await);
        let date = day_start(scratch_day());
        let filter = DailyStatFilter {
            window: TimeWindow {
                start: Some(date),
                end: Some(date + chrono::Duration::days(1)),
            },
            ..Default::default()
        };

        store
            .upsert_by_natural_key(date, &[bucket(date, "a", 1.0), bucket(date, "b", 2.0)])
            .await
            .unwrap();
        let first = store.list_daily_stats(&filter).await.unwrap();
        assert_eq!(first.len(), 2);

        store
            .upsert_by_natural_key(date, &[bucket(date, "a", 5.0)])
            .await
            .unwrap();
        let second = store.list_daily_stats(&filter).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].field_id, "a");
        assert_eq!(second[0].avg_value, 5.0);
        // Updated in place, not re-inserted
        assert_eq!(second[0].id, first[0].id);

        store.upsert_by_natural_key(date, &[]).await.unwrap();
        assert!(store.list_daily_stats(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a scratch PostgreSQL at TEST_DATABASE_URL"]
    async fn test_rollup_rerun_is_identical() {
        // ---
        let store = PgStore::new(test_pool().await);
        let day = scratch_day();
        let noon = day_start(day) + chrono::Duration::hours(12);
        store
            .bulk_insert(&[
                reading("rollup_a", noon, 10.0),
                reading("rollup_a", noon, 20.0),
                reading("rollup_b", noon, 7.0),
            ])
            .await
            .unwrap();
        let filter = DailyStatFilter {
            window: TimeWindow {
                start: Some(day_start(day)),
                end: Some(day_start(day) + chrono::Duration::days(1)),
            },
            ..Default::default()
        };

        let report = run_daily_rollup(&store, &store, day).await.unwrap();
        assert_eq!(report.buckets, 2);
        assert_eq!(report.readings, 3);
        let first = store.list_daily_stats(&filter).await.unwrap();

        run_daily_rollup(&store, &store, day).await.unwrap();
        assert_eq!(store.list_daily_stats(&filter).await.unwrap(), first);
        assert_eq!(first[0].avg_value, 15.0);
    }

    #[tokio::test]
    #[ignore = "requires a scratch PostgreSQL at TEST_DATABASE_URL"]
    async fn test_insert_and_analytics_snapshot() {
        // ---
        let store = PgStore::new(test_pool().await);
        let field = format!("snap_{}", Uuid::new_v4().simple());
        let base = day_start(scratch_day());

        let single = store.insert(&reading(&field, base, 1.0)).await.unwrap();
        assert!(single.id > 0);
        store
            .bulk_insert(&[
                reading(&field, base + chrono::Duration::hours(1), 2.0),
                reading(&field, base + chrono::Duration::hours(2), 3.0),
            ])
            .await
            .unwrap();

        let filter = ReadingFilter {
            field_id: Some(field.clone()),
            ..Default::default()
        };
        let snapshot = store.analytics_snapshot(&filter, 2).await.unwrap();
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].count, 3);
        assert_eq!(snapshot.groups[0].sum, 6.0);
        let recent: Vec<f64> = snapshot.recent.iter().map(|r| r.reading_value).collect();
        assert_eq!(recent, vec![3.0, 2.0]);
        assert!(snapshot.scope_seen);

        let later = ReadingFilter {
            window: TimeWindow {
                start: Some(base + chrono::Duration::days(1)),
                end: None,
            },
            ..filter.clone()
        };
        let snapshot = store.analytics_snapshot(&later, 5).await.unwrap();
        assert!(snapshot.groups.is_empty());
        assert!(snapshot.recent.is_empty());
        assert!(snapshot.scope_seen);

        let unknown = ReadingFilter {
            field_id: Some(format!("missing_{}", Uuid::new_v4().simple())),
            window: later.window,
            ..Default::default()
        };
        assert!(!store.analytics_snapshot(&unknown, 5).await.unwrap().scope_seen);
    }
}
