pub mod health;
pub mod metrics;
pub mod tasks;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Task API and health routes.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/tasks", post(tasks::submit_task))
        .route("/api/v1/tasks/{task_id}", get(tasks::get_task))
        .route("/api/v1/tasks/{task_id}/events", get(tasks::task_events))
        .route("/api/v1/tasks/{task_id}/cancel", post(tasks::cancel_task))
        .with_state(state)
}
