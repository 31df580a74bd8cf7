//! Deferred task workers.
//!
//! Each worker loop claims one task, runs it to completion, records the
//! terminal state on the task row and goes back for the next one. Failures
//! are terminal for that task; nothing is retried automatically.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::queue::{ClaimedTask, DeferredJob};
use crate::services::{aggregation, ingestion, retention};
use crate::AppState;

// ---

/// Run one claimed job and produce the result stored on its task.
pub async fn execute(
    state: &AppState,
    task: &ClaimedTask,
    now: DateTime<Utc>,
) -> Result<Value, StoreError> {
    // ---
    let result = match &task.job {
        DeferredJob::IngestBatch { readings } => {
            let report = ingestion::ingest_deferred(
                state.readings.as_ref(),
                state.queue.as_ref(),
                task.id,
                readings,
                now.date_naive(),
            )
            .await?;
            serde_json::to_value(report)
        }
        DeferredJob::DailyRollup { day } => {
            let day = day.unwrap_or_else(|| aggregation::yesterday(now));
            let report = aggregation::run_daily_rollup(
                state.readings.as_ref(),
                state.rollups.as_ref(),
                day,
            )
            .await?;
            serde_json::to_value(report)
        }
        DeferredJob::Retention => {
            let report =
                retention::purge_expired(state.readings.as_ref(), now, state.config.retention_days)
                    .await?;
            serde_json::to_value(report)
        }
    };

    result.map_err(|e| StoreError::Corrupt(format!("unserializable task result: {e}")))
}

/// Claim and run at most one task. Returns `false` when the queue was empty.
pub async fn run_once(state: &AppState) -> Result<bool, StoreError> {
    // ---
    let Some(task) = state.queue.claim_next(state.config.task_lease).await? else {
        return Ok(false);
    };

    if task.attempts > 1 {
        warn!(
            "Redelivering {} task {} (attempt {})",
            task.job.kind(),
            task.id,
            task.attempts
        );
    } else {
        info!("Running {} task {}", task.job.kind(), task.id);
    }

    match execute(state, &task, Utc::now()).await {
        Ok(result) => {
            state.queue.complete(task.id, result).await?;
            info!("Task {} succeeded", task.id);
        }
        Err(e) => {
            error!("Task {} failed: {}", task.id, e);
            state.queue.fail(task.id, &e.to_string()).await?;
        }
    }
    Ok(true)
}

/// Poll the queue until `shutdown` flips to `true`.
pub async fn run(state: AppState, worker_id: u32, mut shutdown: watch::Receiver<bool>) {
    // ---
    info!("Worker {} started", worker_id);
    while !*shutdown.borrow() {
        let idle = match run_once(&state).await {
            Ok(processed) => !processed,
            Err(e) => {
                error!("Worker {}: queue error: {}", worker_id, e);
                true
            }
        };

        if idle {
            debug!("Worker {} idle", worker_id);
            tokio::select! {
                _ = tokio::time::sleep(state.config.worker_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
    info!("Worker {} stopped", worker_id);
}

/// Start `config.worker_concurrency` worker loops.
pub fn spawn_workers(state: &AppState, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    // ---
    (0..state.config.worker_concurrency.max(1))
        .map(|id| tokio::spawn(run(state.clone(), id, shutdown.clone())))
        .collect()
}
