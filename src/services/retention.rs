//! Data lifecycle: the retention purge and the administrative clear.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, StoreError};
use crate::store::ReadingStore;

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionReport {
    pub deleted_count: u64,
    pub cutoff: DateTime<Utc>,
}

/// Oldest timestamp that survives a purge run at `now`.
pub fn cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(retention_days))
}

/// Delete readings older than `retention_days` before `now`.
///
/// Rollups are left alone; they remain as the only record of purged days.
pub async fn purge_expired(
    readings: &dyn ReadingStore,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<RetentionReport, StoreError> {
    // ---
    let cutoff = cutoff(now, retention_days);
    let deleted_count = readings.delete_before(cutoff).await?;
    info!(
        "Retention: deleted {} reading(s) older than {}",
        deleted_count, cutoff
    );
    Ok(RetentionReport {
        deleted_count,
        cutoff,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClearReport {
    pub deleted_count: u64,
    pub daily_stats_deleted: u64,
    pub timestamp: DateTime<Utc>,
}

/// Irreversibly delete every reading and every rollup bucket.
///
/// Both tables are emptied in one store transaction; on failure nothing is
/// deleted.
pub async fn clear_all(readings: &dyn ReadingStore) -> Result<ClearReport, AppError> {
    // ---
    let cleared = readings.clear_all().await?;
    warn!(
        "Cleared all data: {} reading(s), {} daily stat(s)",
        cleared.readings, cleared.daily_stats
    );
    Ok(ClearReport {
        deleted_count: cleared.readings,
        daily_stats_deleted: cleared.daily_stats,
        timestamp: Utc::now(),
    })
}
