//! Data models for the ingestion and aggregation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// A validated reading that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    // ---
    pub timestamp: DateTime<Utc>,
    pub field_id: String,
    pub sensor_type: String,
    pub reading_value: f64,
    pub unit: String,
}

/// A stored sensor reading as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub field_id: String,
    pub sensor_type: String,
    pub reading_value: f64,
    pub unit: String,
}

impl NewReading {
    // ---
    pub fn into_stored(self, id: i64) -> Reading {
        // ---
        Reading {
            id,
            timestamp: self.timestamp,
            field_id: self.field_id,
            sensor_type: self.sensor_type,
            reading_value: self.reading_value,
            unit: self.unit,
        }
    }
}

/// Precomputed aggregate for one (date, field, sensor type) bucket.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DailyStat {
    // ---
    pub id: i64,
    pub date: DateTime<Utc>,
    pub field_id: String,
    pub sensor_type: String,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub count_readings: i64,
}

/// Rollup bucket computed by the daily job, keyed by its natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDailyStat {
    // ---
    pub date: DateTime<Utc>,
    pub field_id: String,
    pub sensor_type: String,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub count_readings: i64,
}

/// Count, sum and extremes of the readings for one (field, sensor type) pair.
///
/// This is the single shape the store aggregates into; every analytics view
/// and rollup bucket is derived from a slice of these.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct GroupStats {
    // ---
    pub field_id: String,
    pub sensor_type: String,
    pub count: i64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

/// Time window `[start, end)`; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

/// Filters accepted by reading queries and group aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    // ---
    pub field_id: Option<String>,
    pub sensor_type: Option<String>,
    pub window: TimeWindow,
}

impl ReadingFilter {
    pub fn matches(&self, reading: &Reading) -> bool {
        self.field_id.as_ref().map_or(true, |f| &reading.field_id == f)
            && self
                .sensor_type
                .as_ref()
                .map_or(true, |s| &reading.sensor_type == s)
            && self.window.contains(reading.timestamp)
    }
}

/// Offset/limit paging for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}
