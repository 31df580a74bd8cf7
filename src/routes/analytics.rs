//! Analytics endpoints: on-demand summaries and stored daily rollups.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::error::AppError;
use crate::models::{DailyStat, TimeWindow};
use crate::services::aggregation::{self, AnalyticsSummary};
use crate::store::DailyStatFilter;
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/analytics", get(global))
        .route("/analytics/field/{field_id}", get(by_field))
        .route("/analytics/sensor/{sensor_type}", get(by_sensor_type))
        .route("/analytics/daily", get(daily))
}

/// Optional `[start, end)` window shared by the analytics endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl From<WindowQuery> for TimeWindow {
    fn from(q: WindowQuery) -> Self {
        TimeWindow {
            start: q.start,
            end: q.end,
        }
    }
}

async fn global(
    window: Result<Query<WindowQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<AnalyticsSummary>, AppError> {
    // ---
    info!("GET /analytics");
    let Query(window) = window?;
    let summary = aggregation::global_analytics(state.readings.as_ref(), window.into()).await?;
    Ok(Json(summary))
}

async fn by_field(
    Path(field_id): Path<String>,
    window: Result<Query<WindowQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<AnalyticsSummary>, AppError> {
    // ---
    info!("GET /analytics/field/{}", field_id);
    let Query(window) = window?;
    let summary =
        aggregation::field_analytics(state.readings.as_ref(), &field_id, window.into()).await?;
    Ok(Json(summary))
}

async fn by_sensor_type(
    Path(sensor_type): Path<String>,
    window: Result<Query<WindowQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<AnalyticsSummary>, AppError> {
    // ---
    info!("GET /analytics/sensor/{}", sensor_type);
    let Query(window) = window?;
    let summary =
        aggregation::sensor_type_analytics(state.readings.as_ref(), &sensor_type, window.into())
            .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    field_id: Option<String>,
    sensor_type: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn daily(
    query: Result<Query<DailyQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Result<Json<Vec<DailyStat>>, AppError> {
    // ---
    info!("GET /analytics/daily");
    let Query(q) = query?;
    let filter = DailyStatFilter {
        field_id: q.field_id,
        sensor_type: q.sensor_type,
        window: TimeWindow {
            start: q.start,
            end: q.end,
        },
    };
    let rows = aggregation::daily_stats(state.rollups.as_ref(), &filter).await?;
    Ok(Json(rows))
}
