//! In-memory stores for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AnalyticsSnapshot, ClearedRows, DailyStatFilter, ReadingStore, RollupStore};
use crate::error::StoreError;
use crate::models::{
    DailyStat, GroupStats, NewDailyStat, NewReading, Page, Reading, ReadingFilter,
};

// ---

#[derive(Default)]
struct Tables {
    readings: Vec<Reading>,
    next_reading_id: i64,
    daily_stats: Vec<DailyStat>,
    next_stat_id: i64,
}

/// Both stores backed by vectors behind a mutex.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    down: AtomicBool,
    rollup_writes_fail: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make writes to the rollup table fail while readings stay writable.
    pub fn set_rollup_writes_fail(&self, fail: bool) {
        self.rollup_writes_fail.store(fail, Ordering::SeqCst);
    }

    /// Number of read calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.tables.lock().unwrap().readings.clone()
    }

    pub fn daily_stats(&self) -> Vec<DailyStat> {
        self.tables.lock().unwrap().daily_stats.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is down".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_rollup_write(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.rollup_writes_fail.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("daily_stats is not writable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn matching_sorted(readings: &[Reading], filter: &ReadingFilter) -> Vec<Reading> {
    // ---
    let mut rows: Vec<Reading> = readings
        .iter()
        .filter(|r| filter.matches(r))
        .cloned()
        .collect();
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
    rows
}

fn grouped(readings: &[Reading], filter: &ReadingFilter) -> Vec<GroupStats> {
    // ---
    let mut groups: BTreeMap<(String, String), GroupStats> = BTreeMap::new();
    for r in readings.iter().filter(|r| filter.matches(r)) {
        groups
            .entry((r.field_id.clone(), r.sensor_type.clone()))
            .and_modify(|g| {
                g.count += 1;
                g.sum += r.reading_value;
                g.min = g.min.min(r.reading_value);
                g.max = g.max.max(r.reading_value);
            })
            .or_insert_with(|| GroupStats {
                field_id: r.field_id.clone(),
                sensor_type: r.sensor_type.clone(),
                count: 1,
                sum: r.reading_value,
                min: r.reading_value,
                max: r.reading_value,
            });
    }
    groups.into_values().collect()
}

#[async_trait]
impl ReadingStore for MemoryStore {
    // ---
    async fn insert(&self, reading: &NewReading) -> Result<Reading, StoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        t.next_reading_id += 1;
        let stored = reading.clone().into_stored(t.next_reading_id);
        t.readings.push(stored.clone());
        Ok(stored)
    }

    async fn bulk_insert(&self, readings: &[NewReading]) -> Result<Vec<i64>, StoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let mut ids = Vec::with_capacity(readings.len());
        for r in readings {
            t.next_reading_id += 1;
            let id = t.next_reading_id;
            t.readings.push(r.clone().into_stored(id));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn query_by_filters(
        &self,
        filter: &ReadingFilter,
        page: Page,
    ) -> Result<Vec<Reading>, StoreError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let t = self.tables.lock().unwrap();
        Ok(matching_sorted(&t.readings, filter)
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn group_stats(&self, filter: &ReadingFilter) -> Result<Vec<GroupStats>, StoreError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let t = self.tables.lock().unwrap();
        Ok(grouped(&t.readings, filter))
    }

    async fn analytics_snapshot(
        &self,
        filter: &ReadingFilter,
        recent: u32,
    ) -> Result<AnalyticsSnapshot, StoreError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let t = self.tables.lock().unwrap();
        let any_time = ReadingFilter {
            window: Default::default(),
            ..filter.clone()
        };
        Ok(AnalyticsSnapshot {
            groups: grouped(&t.readings, filter),
            recent: matching_sorted(&t.readings, filter)
                .into_iter()
                .take(recent as usize)
                .collect(),
            scope_seen: t.readings.iter().any(|r| any_time.matches(r)),
        })
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.readings.len();
        t.readings.retain(|r| r.timestamp >= cutoff);
        Ok((before - t.readings.len()) as u64)
    }

    async fn clear_all(&self) -> Result<ClearedRows, StoreError> {
        self.check_rollup_write()?;
        let mut t = self.tables.lock().unwrap();
        let cleared = ClearedRows {
            readings: t.readings.len() as u64,
            daily_stats: t.daily_stats.len() as u64,
        };
        t.readings.clear();
        t.daily_stats.clear();
        Ok(cleared)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    // ---
    async fn upsert_by_natural_key(
        &self,
        date: DateTime<Utc>,
        stats: &[NewDailyStat],
    ) -> Result<u64, StoreError> {
        self.check_rollup_write()?;
        let mut guard = self.tables.lock().unwrap();
        let t = &mut *guard;
        t.daily_stats.retain(|d| {
            d.date != date
                || stats
                    .iter()
                    .any(|s| s.field_id == d.field_id && s.sensor_type == d.sensor_type)
        });
        for s in stats {
            let existing = t.daily_stats.iter_mut().find(|d| {
                d.date == s.date && d.field_id == s.field_id && d.sensor_type == s.sensor_type
            });
            match existing {
                Some(d) => {
                    d.avg_value = s.avg_value;
                    d.min_value = s.min_value;
                    d.max_value = s.max_value;
                    d.count_readings = s.count_readings;
                }
                None => {
                    t.next_stat_id += 1;
                    let id = t.next_stat_id;
                    t.daily_stats.push(DailyStat {
                        id,
                        date: s.date,
                        field_id: s.field_id.clone(),
                        sensor_type: s.sensor_type.clone(),
                        avg_value: s.avg_value,
                        min_value: s.min_value,
                        max_value: s.max_value,
                        count_readings: s.count_readings,
                    });
                }
            }
        }
        Ok(stats.len() as u64)
    }

    async fn list_daily_stats(
        &self,
        filter: &DailyStatFilter,
    ) -> Result<Vec<DailyStat>, StoreError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let t = self.tables.lock().unwrap();
        let mut rows: Vec<DailyStat> = t
            .daily_stats
            .iter()
            .filter(|d| {
                filter.field_id.as_ref().map_or(true, |f| &d.field_id == f)
                    && filter
                        .sensor_type
                        .as_ref()
                        .map_or(true, |s| &d.sensor_type == s)
                    && filter.window.contains(d.date)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.date, &a.field_id, &a.sensor_type).cmp(&(b.date, &b.field_id, &b.sensor_type))
        });
        Ok(rows)
    }
}
