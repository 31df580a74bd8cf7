//! On-demand analytics and the daily rollup job.
//!
//! The store does one `GROUP BY field_id, sensor_type` pass; everything else
//! (global totals, per-field and per-sensor-type breakdowns, rollup buckets)
//! is folded from those groups here, so the numeric rules live in one place.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AppError, StoreError};
use crate::models::{DailyStat, GroupStats, NewDailyStat, Reading, ReadingFilter, TimeWindow};
use crate::store::{DailyStatFilter, ReadingStore, RollupStore};

// ---

/// Number of most recent readings attached to an analytics summary.
const RECENT_READINGS: u32 = 5;

/// Count, mean and extremes of a set of values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueStats {
    pub count: i64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Running totals; the mean is only taken once every group is folded in.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: i64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new(g: &GroupStats) -> Self {
        Self {
            count: g.count,
            sum: g.sum,
            min: g.min,
            max: g.max,
        }
    }

    fn add(&mut self, g: &GroupStats) {
        self.count += g.count;
        self.sum += g.sum;
        self.min = self.min.min(g.min);
        self.max = self.max.max(g.max);
    }

    fn finish(self) -> ValueStats {
        ValueStats {
            count: self.count,
            avg: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
        }
    }
}

fn fold_by<'a>(
    groups: &'a [GroupStats],
    key: impl Fn(&'a GroupStats) -> &'a str,
) -> BTreeMap<String, ValueStats> {
    // ---
    let mut acc: BTreeMap<&str, Accumulator> = BTreeMap::new();
    for g in groups.iter().filter(|g| g.count > 0) {
        acc.entry(key(g))
            .and_modify(|a| a.add(g))
            .or_insert_with(|| Accumulator::new(g));
    }
    acc.into_iter()
        .map(|(k, a)| (k.to_string(), a.finish()))
        .collect()
}

fn fold_all(groups: &[GroupStats]) -> Option<ValueStats> {
    // ---
    let mut iter = groups.iter().filter(|g| g.count > 0);
    let mut acc = Accumulator::new(iter.next()?);
    iter.for_each(|g| acc.add(g));
    Some(acc.finish())
}

/// Analytics over a window, optionally scoped to one field or sensor type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub total_readings: i64,
    pub field_count: usize,
    pub sensor_type_count: usize,
    pub fields: Vec<String>,
    pub sensor_types: Vec<String>,
    /// All matching values together; absent when nothing matched.
    pub overall: Option<ValueStats>,
    pub by_field: BTreeMap<String, ValueStats>,
    pub by_sensor_type: BTreeMap<String, ValueStats>,
    pub recent_readings: Vec<Reading>,
}

/// Fold per-(field, sensor type) groups into a summary.
pub fn summarize(filter: &ReadingFilter, groups: &[GroupStats]) -> AnalyticsSummary {
    // ---
    let fields: BTreeSet<&str> = groups
        .iter()
        .filter(|g| g.count > 0)
        .map(|g| g.field_id.as_str())
        .collect();
    let sensor_types: BTreeSet<&str> = groups
        .iter()
        .filter(|g| g.count > 0)
        .map(|g| g.sensor_type.as_str())
        .collect();

    AnalyticsSummary {
        field_id: filter.field_id.clone(),
        sensor_type: filter.sensor_type.clone(),
        start: filter.window.start,
        end: filter.window.end,
        total_readings: groups.iter().map(|g| g.count).sum(),
        field_count: fields.len(),
        sensor_type_count: sensor_types.len(),
        fields: fields.into_iter().map(String::from).collect(),
        sensor_types: sensor_types.into_iter().map(String::from).collect(),
        overall: fold_all(groups),
        by_field: fold_by(groups, |g| g.field_id.as_str()),
        by_sensor_type: fold_by(groups, |g| g.sensor_type.as_str()),
        recent_readings: Vec::new(),
    }
}

/// One summary from one store snapshot.
async fn analytics(
    store: &dyn ReadingStore,
    filter: &ReadingFilter,
) -> Result<(AnalyticsSummary, bool), StoreError> {
    // ---
    let snapshot = store.analytics_snapshot(filter, RECENT_READINGS).await?;
    let mut summary = summarize(filter, &snapshot.groups);
    summary.recent_readings = snapshot.recent;
    Ok((summary, snapshot.scope_seen))
}

/// Analytics over every reading in the window. Never fails on empty data.
pub async fn global_analytics(
    store: &dyn ReadingStore,
    window: TimeWindow,
) -> Result<AnalyticsSummary, AppError> {
    // ---
    let filter = ReadingFilter {
        window,
        ..Default::default()
    };
    let (summary, _) = analytics(store, &filter).await?;
    debug!("Global analytics: {} readings", summary.total_readings);
    Ok(summary)
}

/// Run a scoped query; NotFound when the scope has never had a reading.
async fn scoped_analytics(
    store: &dyn ReadingStore,
    filter: ReadingFilter,
    resource: &'static str,
    id: &str,
) -> Result<AnalyticsSummary, AppError> {
    // ---
    let (summary, scope_seen) = analytics(store, &filter).await?;
    if scope_seen {
        Ok(summary)
    } else {
        Err(AppError::not_found(resource, id))
    }
}

pub async fn field_analytics(
    store: &dyn ReadingStore,
    field_id: &str,
    window: TimeWindow,
) -> Result<AnalyticsSummary, AppError> {
    // ---
    let filter = ReadingFilter {
        field_id: Some(field_id.to_string()),
        window,
        ..Default::default()
    };
    scoped_analytics(store, filter, "field", field_id).await
}

pub async fn sensor_type_analytics(
    store: &dyn ReadingStore,
    sensor_type: &str,
    window: TimeWindow,
) -> Result<AnalyticsSummary, AppError> {
    // ---
    let filter = ReadingFilter {
        sensor_type: Some(sensor_type.to_string()),
        window,
        ..Default::default()
    };
    scoped_analytics(store, filter, "sensor type", sensor_type).await
}

/// Stored rollup rows.
pub async fn daily_stats(
    rollups: &dyn RollupStore,
    filter: &DailyStatFilter,
) -> Result<Vec<DailyStat>, AppError> {
    Ok(rollups.list_daily_stats(filter).await?)
}

// ---

/// UTC midnight starting `day`.
pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::default()).and_utc()
}

/// The day before `now`, in UTC.
pub fn yesterday(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap_or(NaiveDate::MIN)
}

/// One rollup bucket per non-empty group.
pub fn rollup_buckets(day: NaiveDate, groups: &[GroupStats]) -> Vec<NewDailyStat> {
    // ---
    let date = day_start(day);
    groups
        .iter()
        .filter(|g| g.count > 0)
        .map(|g| {
            let stats = Accumulator::new(g).finish();
            NewDailyStat {
                date,
                field_id: g.field_id.clone(),
                sensor_type: g.sensor_type.clone(),
                avg_value: stats.avg,
                min_value: stats.min,
                max_value: stats.max,
                count_readings: stats.count,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupReport {
    pub date: NaiveDate,
    pub buckets: usize,
    pub readings: i64,
}

/// Recompute and replace the daily stats of `day`.
///
/// Re-running for the same day with unchanged readings leaves the rows
/// exactly as they were.
pub async fn run_daily_rollup(
    readings: &dyn ReadingStore,
    rollups: &dyn RollupStore,
    day: NaiveDate,
) -> Result<RollupReport, StoreError> {
    // ---
    let start = day_start(day);
    let end = day_start(day.succ_opt().unwrap_or(NaiveDate::MAX));
    let filter = ReadingFilter {
        window: TimeWindow {
            start: Some(start),
            end: Some(end),
        },
        ..Default::default()
    };

    let groups = readings.group_stats(&filter).await?;
    let buckets = rollup_buckets(day, &groups);
    rollups.upsert_by_natural_key(start, &buckets).await?;

    let report = RollupReport {
        date: day,
        buckets: buckets.len(),
        readings: buckets.iter().map(|b| b.count_readings).sum(),
    };
    info!(
        "Daily rollup for {}: {} bucket(s) from {} reading(s)",
        day, report.buckets, report.readings
    );
    Ok(report)
}
