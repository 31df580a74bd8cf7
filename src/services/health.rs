//! Dependency health checks.
//!
//! A check never returns an error; an unreachable or slow dependency is
//! reported as `down` and the overall status as `degraded`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::StoreError;
use crate::queue::TaskQueue;
use crate::store::ReadingStore;

// ---

/// Upper bound on each dependency check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub database: DependencyState,
    pub broker: DependencyState,
    pub timestamp: DateTime<Utc>,
}

async fn check_dependency<F>(name: &str, fut: F) -> DependencyState
where
    F: std::future::Future<Output = Result<(), StoreError>>,
{
    // ---
    match tokio::time::timeout(CHECK_TIMEOUT, fut).await {
        Ok(Ok(())) => DependencyState::Up,
        Ok(Err(e)) => {
            warn!("Health check for {} failed: {}", name, e);
            DependencyState::Down
        }
        Err(_) => {
            warn!("Health check for {} timed out", name);
            DependencyState::Down
        }
    }
}

/// Check the reading store and the task broker concurrently.
pub async fn check(readings: &dyn ReadingStore, queue: &dyn TaskQueue) -> HealthReport {
    // ---
    let (database, broker) = tokio::join!(
        check_dependency("database", readings.ping()),
        check_dependency("broker", queue.ping())
    );
    let status = if database == DependencyState::Up && broker == DependencyState::Up {
        OverallStatus::Healthy
    } else {
        OverallStatus::Degraded
    };
    HealthReport {
        status,
        database,
        broker,
        timestamp: Utc::now(),
    }
}
