//! Persistence gateway for readings and daily rollups.
//!
//! Business logic only sees the two narrow traits below; SQL lives in
//! `postgres`. The in-memory implementation backs the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    DailyStat, GroupStats, NewDailyStat, NewReading, Page, Reading, ReadingFilter, TimeWindow,
};

mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::PgStore;

// ---

/// Append-only table of raw readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Store one reading and return it with its assigned id.
    ///
    /// Used for single-element batches; larger batches go through
    /// [`ReadingStore::bulk_insert`].
    async fn insert(&self, reading: &NewReading) -> Result<Reading, StoreError>;

    /// Store all readings in one transaction; ids are returned in input order.
    async fn bulk_insert(&self, readings: &[NewReading]) -> Result<Vec<i64>, StoreError>;

    /// Matching readings, newest first.
    async fn query_by_filters(
        &self,
        filter: &ReadingFilter,
        page: Page,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Count/sum/min/max of matching readings per (field, sensor type).
    async fn group_stats(&self, filter: &ReadingFilter) -> Result<Vec<GroupStats>, StoreError>;

    /// Everything one analytics call needs, read from a single snapshot.
    ///
    /// `recent` caps the number of newest readings returned.
    async fn analytics_snapshot(
        &self,
        filter: &ReadingFilter,
        recent: u32,
    ) -> Result<AnalyticsSnapshot, StoreError>;

    /// Delete readings strictly older than `cutoff`.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete every reading and every rollup bucket in one transaction.
    ///
    /// Either both tables are emptied or neither is.
    async fn clear_all(&self) -> Result<ClearedRows, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Consistent view of the readings behind one analytics summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsSnapshot {
    pub groups: Vec<GroupStats>,
    /// Newest matching readings first.
    pub recent: Vec<Reading>,
    /// Whether any reading matches the field/sensor part of the filter,
    /// ignoring its time window.
    pub scope_seen: bool,
}

/// Row counts removed by [`ReadingStore::clear_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedRows {
    pub readings: u64,
    pub daily_stats: u64,
}

/// Filters for reading back rollup rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyStatFilter {
    pub field_id: Option<String>,
    pub sensor_type: Option<String>,
    /// Applied to the bucket's `date`.
    pub window: TimeWindow,
}

/// Precomputed per-day buckets keyed by (date, field, sensor type).
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Replace the buckets of `date` with `stats`.
    ///
    /// Existing rows are updated in place by natural key, new keys are
    /// inserted, and rows of that date whose key is absent from `stats` are
    /// removed. Returns the number of rows written.
    async fn upsert_by_natural_key(
        &self,
        date: DateTime<Utc>,
        stats: &[NewDailyStat],
    ) -> Result<u64, StoreError>;

    async fn list_daily_stats(&self, filter: &DailyStatFilter)
        -> Result<Vec<DailyStat>, StoreError>;
}
