//! Strata server library logic: configuration and HTTP wiring around the
//! data-access layer.

pub mod config;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use strata_db::Manager;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database lifecycle owner.
    pub db: Arc<Manager>,
}

/// Health check handler.
///
/// Probes the database on a blocking thread and reports pool usage.
/// Returns `503` when the probe fails or the pool is closed.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db = Arc::clone(&state.db);
    let result = tokio::task::spawn_blocking(move || {
        db.health()?;
        db.stats()
    })
    .await;

    match result {
        Ok(Ok(stats)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "pool": {
                    "max_open": stats.max_open,
                    "open": stats.open,
                    "idle": stats.idle,
                    "in_use": stats.in_use,
                    "wait_count": stats.wait_count,
                    "wait_duration_ms": stats.wait_duration.as_millis() as u64,
                }
            })),
        ),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "health check task panicked or was cancelled");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": "health check aborted" })),
            )
        }
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
