//! Deferred task queue.
//!
//! Work that should not run inside a request (large ingestion batches, the
//! daily rollup, the retention purge) is submitted here and executed later by
//! the worker loops in `worker`. Delivery is at-least-once: a task whose
//! worker disappears mid-run is handed out again once its lease expires.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::PgTaskQueue;

// ---

/// Opaque identifier handed back to submitters.
pub type TaskId = Uuid;

/// A unit of deferred work and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredJob {
    /// Validate and insert a large batch; elements are kept as submitted.
    IngestBatch { readings: Vec<Value> },
    /// Materialize daily stats for `day`, or yesterday when absent.
    DailyRollup { day: Option<NaiveDate> },
    /// Purge readings older than the retention window.
    Retention,
}

impl DeferredJob {
    pub fn kind(&self) -> &'static str {
        match self {
            DeferredJob::IngestBatch { .. } => "ingest_batch",
            DeferredJob::DailyRollup { .. } => "daily_rollup",
            DeferredJob::Retention => "retention",
        }
    }

    /// Both jobs are daily rollups of the same day.
    pub fn is_same_rollup(&self, other: &DeferredJob) -> bool {
        matches!(
            (self, other),
            (DeferredJob::DailyRollup { day: a }, DeferredJob::DailyRollup { day: b }) if a == b
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

/// Externally visible state of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub kind: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task a worker has taken ownership of.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub job: DeferredJob,
    /// Includes this delivery; anything above 1 is a redelivery.
    pub attempts: i32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job and return its id without waiting for it to run.
    ///
    /// A daily rollup whose day already has a pending rollup is not queued
    /// again; the pending task's id is returned instead.
    async fn submit(&self, job: &DeferredJob) -> Result<TaskId, StoreError>;

    /// Enqueue a job unless a task was ever submitted under `key`.
    ///
    /// Returns `None` when nothing was queued.
    async fn submit_once(&self, job: &DeferredJob, key: &str)
        -> Result<Option<TaskId>, StoreError>;

    async fn status(&self, id: TaskId) -> Result<Option<TaskHandle>, StoreError>;

    /// Take the oldest pending task, or a running one whose lease ran out.
    ///
    /// A daily rollup is skipped while another rollup of the same day is
    /// running under a live lease.
    async fn claim_next(&self, lease: Duration) -> Result<Option<ClaimedTask>, StoreError>;

    async fn set_progress(&self, id: TaskId, progress: Progress) -> Result<(), StoreError>;

    async fn complete(&self, id: TaskId, result: Value) -> Result<(), StoreError>;

    async fn fail(&self, id: TaskId, error: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
