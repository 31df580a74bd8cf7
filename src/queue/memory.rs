//! In-memory task queue for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{ClaimedTask, DeferredJob, Progress, TaskHandle, TaskId, TaskQueue, TaskStatus};
use crate::error::StoreError;

// ---

struct Entry {
    handle: TaskHandle,
    job: DeferredJob,
    dedup_key: Option<String>,
    claimed_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<Entry>>,
    down: AtomicBool,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Jobs in submission order, with their current status.
    pub fn jobs(&self) -> Vec<(DeferredJob, TaskStatus)> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.job.clone(), e.handle.status))
            .collect()
    }

    /// Queue `job`, or return the id of the task that blocks it.
    fn insert(&self, job: &DeferredJob, key: Option<&str>) -> Result<TaskId, TaskId> {
        let mut tasks = self.tasks.lock().unwrap();
        let blocker = tasks.iter().find(|e| {
            (key.is_some() && e.dedup_key.as_deref() == key)
                || (e.handle.status == TaskStatus::Pending && e.job.is_same_rollup(job))
        });
        if let Some(e) = blocker {
            return Err(e.handle.task_id);
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        tasks.push(Entry {
            handle: TaskHandle {
                task_id: id,
                kind: job.kind().to_string(),
                status: TaskStatus::Pending,
                progress: None,
                result: None,
                error: None,
                attempts: 0,
                created_at: now,
                updated_at: now,
            },
            job: job.clone(),
            dedup_key: key.map(String::from),
            claimed_at: None,
        });
        Ok(id)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory broker is down".to_string()))
        } else {
            Ok(())
        }
    }

    fn update(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut TaskHandle),
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(e) = tasks
            .iter_mut()
            .find(|e| e.handle.task_id == id && e.handle.status == TaskStatus::Running)
        {
            f(&mut e.handle);
            e.handle.updated_at = Utc::now();
            if e.handle.status.is_terminal() {
                e.claimed_at = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    // ---
    async fn submit(&self, job: &DeferredJob) -> Result<TaskId, StoreError> {
        self.check()?;
        Ok(self.insert(job, None).unwrap_or_else(|pending| pending))
    }

    async fn submit_once(
        &self,
        job: &DeferredJob,
        key: &str,
    ) -> Result<Option<TaskId>, StoreError> {
        self.check()?;
        Ok(self.insert(job, Some(key)).ok())
    }

    async fn status(&self, id: TaskId) -> Result<Option<TaskHandle>, StoreError> {
        self.check()?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.handle.task_id == id)
            .map(|e| e.handle.clone()))
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<ClaimedTask>, StoreError> {
        self.check()?;
        let mut tasks = self.tasks.lock().unwrap();
        let leased = |e: &Entry| {
            e.handle.status == TaskStatus::Running
                && e.claimed_at.is_some_and(|at| at.elapsed() < lease)
        };
        let position = tasks.iter().position(|e| {
            let due = match e.handle.status {
                TaskStatus::Pending => true,
                TaskStatus::Running => !leased(e),
                _ => false,
            };
            due && !tasks.iter().any(|other| {
                other.handle.task_id != e.handle.task_id
                    && leased(other)
                    && other.job.is_same_rollup(&e.job)
            })
        });
        Ok(position.map(|i| {
            let e = &mut tasks[i];
            e.handle.status = TaskStatus::Running;
            e.handle.attempts += 1;
            e.handle.updated_at = Utc::now();
            e.claimed_at = Some(Instant::now());
            ClaimedTask {
                id: e.handle.task_id,
                job: e.job.clone(),
                attempts: e.handle.attempts,
            }
        }))
    }

    async fn set_progress(&self, id: TaskId, progress: Progress) -> Result<(), StoreError> {
        self.update(id, |h| h.progress = Some(progress))
    }

    async fn complete(&self, id: TaskId, result: Value) -> Result<(), StoreError> {
        self.update(id, |h| {
            h.status = TaskStatus::Succeeded;
            h.result = Some(result);
        })
    }

    async fn fail(&self, id: TaskId, error: &str) -> Result<(), StoreError> {
        self.update(id, |h| {
            h.status = TaskStatus::Failed;
            h.error = Some(error.to_string());
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        // ---
        let queue = MemoryTaskQueue::new();
        let id = queue.submit(&DeferredJob::Retention).await.unwrap();

        let first = queue
            .claim_next(Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, id);
        assert_eq!(first.attempts, 1);
        assert!(queue
            .claim_next(Duration::from_secs(600))
            .await
            .unwrap()
            .is_none());

        // A zero lease means the running task is immediately redeliverable
        let again = queue.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_not_reclaimed() {
        // ---
        let queue = MemoryTaskQueue::new();
        let id = queue.submit(&DeferredJob::Retention).await.unwrap();
        queue.claim_next(Duration::ZERO).await.unwrap().unwrap();
        queue.fail(id, "boom").await.unwrap();

        assert!(queue.claim_next(Duration::ZERO).await.unwrap().is_none());
        let handle = queue.status(id).await.unwrap().unwrap();
        assert_eq!(handle.status, TaskStatus::Failed);
        assert_eq!(handle.error.as_deref(), Some("boom"));

        // Terminal state is final
        queue.complete(id, Value::Null).await.unwrap();
        let handle = queue.status(id).await.unwrap().unwrap();
        assert_eq!(handle.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_pending_rollup_for_same_day_is_coalesced() {
        // ---
        let queue = MemoryTaskQueue::new();
        let day = chrono::NaiveDate::from_ymd_opt(2024, 5, 9);
        let first = queue
            .submit(&DeferredJob::DailyRollup { day })
            .await
            .unwrap();
        let second = queue
            .submit(&DeferredJob::DailyRollup { day })
            .await
            .unwrap();
        assert_eq!(first, second);

        let other_day = queue
            .submit(&DeferredJob::DailyRollup {
                day: chrono::NaiveDate::from_ymd_opt(2024, 5, 10),
            })
            .await
            .unwrap();
        assert_ne!(first, other_day);
        assert_eq!(queue.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_rollup_waits_for_running_rollup_of_same_day() {
        // ---
        let queue = MemoryTaskQueue::new();
        let day = chrono::NaiveDate::from_ymd_opt(2024, 5, 9);
        let lease = Duration::from_secs(600);

        let running = queue
            .submit(&DeferredJob::DailyRollup { day })
            .await
            .unwrap();
        queue.claim_next(lease).await.unwrap().unwrap();

        // Readings arrived mid-run; a fresh rollup is queued behind it
        let queued = queue
            .submit(&DeferredJob::DailyRollup { day })
            .await
            .unwrap();
        assert_ne!(queued, running);
        let retention = queue.submit(&DeferredJob::Retention).await.unwrap();

        let next = queue.claim_next(lease).await.unwrap().unwrap();
        assert_eq!(next.id, retention);
        assert!(queue.claim_next(lease).await.unwrap().is_none());

        queue.complete(running, Value::Null).await.unwrap();
        let next = queue.claim_next(lease).await.unwrap().unwrap();
        assert_eq!(next.id, queued);
    }

    #[tokio::test]
    async fn test_submit_once_per_key() {
        // ---
        let queue = MemoryTaskQueue::new();
        let first = queue
            .submit_once(&DeferredJob::Retention, "retention:2024-05-10")
            .await
            .unwrap();
        assert!(first.is_some());

        // Still refused after the first task finished
        queue.claim_next(Duration::from_secs(600)).await.unwrap();
        queue.complete(first.unwrap(), Value::Null).await.unwrap();
        let again = queue
            .submit_once(&DeferredJob::Retention, "retention:2024-05-10")
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(queue.jobs().len(), 1);
    }
}
