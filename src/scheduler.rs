//! Daily trigger for the rollup and retention jobs.
//!
//! The scheduler only enqueues; the jobs themselves run on the workers. The
//! rollup day is fixed when the task is queued so a redelivered task
//! recomputes the same day even if it runs after midnight. Every worker
//! process runs a scheduler; jobs are submitted under a per-day key so only
//! the first one to wake up queues anything.

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::queue::{DeferredJob, TaskId, TaskQueue};
use crate::services::aggregation;
use crate::AppState;

// ---

/// First `hour:00` UTC strictly after `now`.
pub fn next_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    // ---
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        now.date_naive()
            .checked_add_days(Days::new(1))
            .map(|d| d.and_time(at).and_utc())
            .unwrap_or(today)
    }
}

/// Queue yesterday's rollup and a retention run, once per day.
///
/// Returns the ids of the tasks this call queued; empty when another
/// scheduler got there first.
pub async fn enqueue_daily_jobs(
    queue: &dyn TaskQueue,
    now: DateTime<Utc>,
) -> Result<Vec<TaskId>, StoreError> {
    // ---
    let day = aggregation::yesterday(now);
    let jobs = [
        (
            DeferredJob::DailyRollup { day: Some(day) },
            format!("scheduled:daily_rollup:{day}"),
        ),
        (
            DeferredJob::Retention,
            format!("scheduled:retention:{}", now.date_naive()),
        ),
    ];

    let mut queued = Vec::new();
    for (job, key) in &jobs {
        match queue.submit_once(job, key).await? {
            Some(id) => {
                info!("Scheduled {} for {} as task {}", job.kind(), day, id);
                queued.push(id);
            }
            None => debug!("{} for {} already scheduled", job.kind(), day),
        }
    }
    Ok(queued)
}

/// Sleep until each configured run time and enqueue the daily jobs.
pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    // ---
    let hour = state.config.rollup_hour_utc;
    loop {
        let now = Utc::now();
        let at = next_run(now, hour);
        let wait = (at - now).to_std().unwrap_or_default();
        info!("Next daily jobs at {}", at);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if let Err(e) = enqueue_daily_jobs(state.queue.as_ref(), Utc::now()).await {
            error!("Failed to schedule daily jobs: {}", e);
        }
    }
    info!("Scheduler stopped");
}
