//! `GET /task/{task_id}`: status of a deferred task.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::queue::TaskHandle;
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/task/{task_id}", get(handler))
}

async fn handler(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TaskHandle>, AppError> {
    // ---
    info!("GET /task/{}", task_id);

    // Anything that is not a UUID can never have been issued
    let Ok(id) = Uuid::parse_str(&task_id) else {
        return Err(AppError::not_found("task", task_id));
    };

    state
        .queue
        .status(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("task", task_id))
}
