//! `POST /sensor-data`: reading ingestion.
//!
//! The body is taken as raw JSON values so that validation can report every
//! bad element by index instead of failing on the first deserialization
//! error.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::Value;
use tracing::info;

use crate::error::AppError;
use crate::services::ingestion::{self, IngestOutcome};
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/sensor-data", post(handler))
}

async fn handler(
    State(state): State<AppState>,
    body: Result<Json<Vec<Value>>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    // ---
    let Json(batch) = body?;
    info!("POST /sensor-data - {} element(s)", batch.len());

    let outcome = ingestion::ingest(
        state.readings.as_ref(),
        state.queue.as_ref(),
        &state.config,
        batch,
    )
    .await?;

    let status = match outcome {
        IngestOutcome::Stored { .. } => StatusCode::CREATED,
        IngestOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}
