//! `DELETE /data/clear`: administrative wipe of readings and rollups.

use axum::{extract::State, routing::delete, Json, Router};
use tracing::warn;

use crate::error::AppError;
use crate::services::retention::{self, ClearReport};
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/data/clear", delete(handler))
}

async fn handler(State(state): State<AppState>) -> Result<Json<ClearReport>, AppError> {
    // ---
    warn!("DELETE /data/clear - wiping all readings and daily stats");
    let report = retention::clear_all(state.readings.as_ref()).await?;
    Ok(Json(report))
}
