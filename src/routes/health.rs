// src/routes/health.rs
//! API health check endpoint for the Field Insights backend.
//!
//! This module defines the `/health` route used by container orchestrators
//! (e.g., Docker, Kubernetes) and CI pipelines to verify that the service is
//! running and that its dependencies are reachable. It is a sibling module in
//! the `routes` directory and follows the Explicit Module Boundary Pattern
//! (EMBP):
//! - Internal to this file: endpoint handler(s)
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route
//!
//! The gateway merges this subrouter into the top-level API router so that
//! `main.rs` does not need to know about individual endpoints.

use axum::{extract::State, routing::get, Json, Router};

use crate::services::health::{self, HealthReport};
use crate::AppState;

/// Handle `GET /health`.
///
/// Checks the database and the task broker and always answers `200 OK`;
/// an unreachable dependency shows up as `down` with an overall status of
/// `degraded` rather than as an error.
async fn handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(health::check(state.readings.as_ref(), state.queue.as_ref()).await)
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(handler))
}
