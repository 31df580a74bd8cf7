//! Task queue stored in the `deferred_tasks` table of the broker database.
//!
//! Workers claim rows with `FOR UPDATE SKIP LOCKED`, so any number of worker
//! processes can poll the same table without handing one task to two of them
//! at once. Two unique indexes back the submission rules: one on
//! `dedup_key`, and a partial one allowing a single pending `daily_rollup`
//! per day.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::{ClaimedTask, DeferredJob, Progress, TaskHandle, TaskId, TaskQueue, TaskStatus};
use crate::error::StoreError;

// ---

#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

/// Attempts at queueing a rollup when its pending twin keeps getting claimed.
const SUBMIT_ATTEMPTS: usize = 3;

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a pending task; `None` when a unique index rejected it.
    async fn insert(
        &self,
        job: &DeferredJob,
        key: Option<&str>,
    ) -> Result<Option<TaskId>, StoreError> {
        // ---
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO deferred_tasks (id, kind, payload, status, dedup_key)
            VALUES ($1, $2, $3, 'pending', $4)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.kind())
        .bind(Json(job))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = id {
            tracing::debug!("Submitted {} task {}", job.kind(), id);
        }
        Ok(id)
    }

    /// Id of the pending rollup covering the same day as `job`.
    async fn pending_twin(&self, job: &DeferredJob) -> Result<Option<TaskId>, StoreError> {
        // ---
        let DeferredJob::DailyRollup { day } = job else {
            return Ok(None);
        };
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM deferred_tasks
            WHERE kind = 'daily_rollup'
              AND status = 'pending'
              AND payload->>'day' IS NOT DISTINCT FROM $1
            "#,
        )
        .bind(day.map(|d| d.to_string()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    kind: String,
    status: String,
    progress: Option<Json<Progress>>,
    result: Option<Json<Value>>,
    error: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for TaskHandle {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("task {} has unknown status '{}'", row.id, row.status))
        })?;
        Ok(TaskHandle {
            task_id: row.id,
            kind: row.kind,
            status,
            progress: row.progress.map(|p| p.0),
            result: row.result.map(|r| r.0),
            error: row.error,
            attempts: row.attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    // ---
    async fn submit(&self, job: &DeferredJob) -> Result<TaskId, StoreError> {
        // ---
        for _ in 0..SUBMIT_ATTEMPTS {
            if let Some(id) = self.insert(job, None).await? {
                return Ok(id);
            }
            if let Some(id) = self.pending_twin(job).await? {
                tracing::debug!("{} already pending as task {}", job.kind(), id);
                return Ok(id);
            }
        }
        Err(StoreError::Unavailable(format!(
            "could not queue {} task after {} attempts",
            job.kind(),
            SUBMIT_ATTEMPTS
        )))
    }

    async fn submit_once(
        &self,
        job: &DeferredJob,
        key: &str,
    ) -> Result<Option<TaskId>, StoreError> {
        // ---
        let id = self.insert(job, Some(key)).await?;
        if id.is_none() {
            tracing::debug!("{} task for '{}' already submitted", job.kind(), key);
        }
        Ok(id)
    }

    async fn status(&self, id: TaskId) -> Result<Option<TaskHandle>, StoreError> {
        // ---
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, kind, status, progress, result, error, attempts, created_at, updated_at
            FROM deferred_tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskHandle::try_from).transpose()
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<ClaimedTask>, StoreError> {
        // ---
        let row: Option<(Uuid, Value, i32)> = sqlx::query_as(
            r#"
            UPDATE deferred_tasks
            SET status = 'running',
                attempts = attempts + 1,
                locked_at = now(),
                updated_at = now()
            WHERE id = (
                SELECT t.id FROM deferred_tasks t
                WHERE (t.status = 'pending'
                       OR (t.status = 'running'
                           AND t.locked_at < now() - make_interval(secs => $1)))
                  AND NOT (
                      t.kind = 'daily_rollup'
                      AND EXISTS (
                          SELECT 1 FROM deferred_tasks r
                          WHERE r.kind = 'daily_rollup'
                            AND r.status = 'running'
                            AND r.id <> t.id
                            AND r.locked_at >= now() - make_interval(secs => $1)
                            AND r.payload->>'day' IS NOT DISTINCT FROM t.payload->>'day'
                      )
                  )
                ORDER BY t.created_at
                FOR UPDATE OF t SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, payload, attempts)) = row else {
            return Ok(None);
        };

        match serde_json::from_value::<DeferredJob>(payload) {
            Ok(job) => Ok(Some(ClaimedTask { id, job, attempts })),
            Err(e) => {
                let msg = format!("undecodable task payload: {e}");
                self.fail(id, &msg).await?;
                Err(StoreError::Corrupt(format!("task {id}: {msg}")))
            }
        }
    }

    async fn set_progress(&self, id: TaskId, progress: Progress) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            UPDATE deferred_tasks
            SET progress = $2, locked_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(Json(progress))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, id: TaskId, result: Value) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            UPDATE deferred_tasks
            SET status = 'succeeded', result = $2, locked_at = NULL, updated_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(Json(result))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: TaskId, error: &str) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            UPDATE deferred_tasks
            SET status = 'failed', error = $2, locked_at = NULL, updated_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        // ---
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
