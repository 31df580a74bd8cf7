//! Route gateway for the `field-insights` API.
//!
//! Each sibling module owns one slice of the HTTP surface and exports a
//! subrouter; this gateway merges them, installs the CORS and request tracing
//! layers, and binds the shared [`AppState`]. `main.rs` only ever sees
//! [`router`] (EMBP).

use axum::{http::HeaderValue, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{AppState, Config};

mod admin;
mod analytics;
mod health;
mod readings;
mod sensor_data;
mod tasks;

// ---

pub fn router(state: AppState) -> Router {
    // ---
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(root))
        .merge(sensor_data::router())
        .merge(readings::router())
        .merge(analytics::router())
        .merge(tasks::router())
        .merge(admin::router())
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Handle `GET /` with a short service banner.
async fn root() -> Json<Value> {
    Json(json!({
        "message": "Field Insights API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn cors_layer(config: &Config) -> CorsLayer {
    // ---
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
