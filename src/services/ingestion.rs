//! Ingestion: small batches are stored inline, large ones go to the queue.
//!
//! The two paths deliberately differ in failure handling. An inline batch is
//! all-or-nothing: one bad element rejects the call and nothing is written.
//! A deferred batch is best effort: valid elements are inserted and the bad
//! ones are listed in the task result.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{AppError, StoreError};
use crate::queue::{DeferredJob, Progress, TaskId, TaskQueue};
use crate::store::ReadingStore;
use crate::validation::{self, ValidationIssue};
use crate::Config;

// ---

/// Rows per transaction when a deferred batch is written.
const DEFERRED_CHUNK_ROWS: usize = 500;

/// What the caller gets back from [`ingest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IngestOutcome {
    Stored { count: usize, ids: Vec<i64> },
    Queued { task_id: TaskId, status: &'static str },
}

/// Accept a batch of raw reading objects.
///
/// Batches shorter than `config.batch_threshold` are validated and stored in
/// one transaction. Longer batches are handed to the task queue untouched
/// and the task id is returned immediately.
pub async fn ingest(
    readings: &dyn ReadingStore,
    queue: &dyn TaskQueue,
    config: &Config,
    batch: Vec<Value>,
) -> Result<IngestOutcome, AppError> {
    // ---
    if batch.len() >= config.batch_threshold {
        let size = batch.len();
        let task_id = queue
            .submit(&DeferredJob::IngestBatch { readings: batch })
            .await?;
        info!("Queued batch of {} readings as task {}", size, task_id);
        return Ok(IngestOutcome::Queued {
            task_id,
            status: "queued",
        });
    }

    let valid = validation::validate_all(&batch).map_err(|issues| {
        debug!(
            "Rejected batch of {}: {} validation issue(s)",
            batch.len(),
            issues.len()
        );
        AppError::Validation(issues)
    })?;

    if valid.is_empty() {
        return Ok(IngestOutcome::Stored {
            count: 0,
            ids: Vec::new(),
        });
    }

    let ids = match valid.as_slice() {
        [single] => vec![readings.insert(single).await?.id],
        many => readings.bulk_insert(many).await?,
    };
    info!("Stored {} readings", ids.len());
    Ok(IngestOutcome::Stored {
        count: ids.len(),
        ids,
    })
}

/// Result recorded on an `ingest_batch` task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredIngestReport {
    pub processed_count: usize,
    pub failed_count: usize,
    pub failures: Vec<ValidationIssue>,
    /// Closed days touched by the batch whose rollups were re-queued.
    pub rollup_days: Vec<NaiveDate>,
}

/// Worker side of a queued batch.
///
/// Invalid elements are skipped and reported; valid ones are written in
/// chunks. Running the same task twice inserts its readings twice.
pub async fn ingest_deferred(
    readings: &dyn ReadingStore,
    queue: &dyn TaskQueue,
    task_id: TaskId,
    batch: &[Value],
    today: NaiveDate,
) -> Result<DeferredIngestReport, StoreError> {
    // ---
    let total = batch.len() as u64;
    let validation::Partitioned { valid, issues } = validation::partition(batch);
    if !issues.is_empty() {
        warn!(
            "Task {}: {} of {} element(s) failed validation",
            task_id,
            issues.len(),
            batch.len()
        );
    }

    let mut done = issues.len() as u64;
    queue
        .set_progress(
            task_id,
            Progress {
                current: done,
                total,
            },
        )
        .await?;

    let mut processed = 0;
    for chunk in valid.chunks(DEFERRED_CHUNK_ROWS) {
        let ids = readings.bulk_insert(chunk).await?;
        processed += ids.len();
        done += chunk.len() as u64;
        queue
            .set_progress(
                task_id,
                Progress {
                    current: done,
                    total,
                },
            )
            .await?;
    }

    let rollup_days: BTreeSet<NaiveDate> = valid
        .iter()
        .map(|r| r.timestamp.date_naive())
        .filter(|d| *d < today)
        .collect();
    for day in &rollup_days {
        queue
            .submit(&DeferredJob::DailyRollup { day: Some(*day) })
            .await?;
    }

    info!(
        "Task {}: inserted {} reading(s), {} rejected",
        task_id,
        processed,
        issues.len()
    );
    Ok(DeferredIngestReport {
        processed_count: processed,
        failed_count: issues.len(),
        failures: issues,
        rollup_days: rollup_days.into_iter().collect(),
    })
}
