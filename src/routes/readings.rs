//! `GET /readings`: filtered, paged listing of stored readings.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::{Page, Reading, ReadingFilter, TimeWindow};
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", get(handler))
}

/// Query parameters for filtering sensor readings
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    field_id: Option<String>,
    sensor_type: Option<String>,
    /// Inclusive lower bound, RFC 3339
    start: Option<DateTime<Utc>>,
    /// Exclusive upper bound, RFC 3339
    end: Option<DateTime<Utc>>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn handler(
    query: Result<Query<ReadingsQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Reading>>, AppError> {
    // ---
    info!("GET /readings");
    let Query(params) = query?;
    debug!("Apply filter: {:?}", params);

    let filter = ReadingFilter {
        field_id: params.field_id,
        sensor_type: params.sensor_type,
        window: TimeWindow {
            start: params.start,
            end: params.end,
        },
    };
    let page = Page {
        limit: state.config.readings_limit(params.limit),
        offset: params.offset.unwrap_or(0),
    };

    let rows = state.readings.query_by_filters(&filter, page).await?;
    debug!("GET /readings - returning {} readings", rows.len());
    Ok(Json(rows))
}
