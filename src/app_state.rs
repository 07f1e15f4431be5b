use std::sync::Arc;

use crate::services::{progress::ProgressPublisher, queue::TaskStream, store::ResultStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ResultStore>,
    pub queue: Arc<dyn TaskStream>,
    /// Terminal messages for tasks the API finishes itself.
    pub publisher: Arc<dyn ProgressPublisher>,
    /// Pub/sub client for live progress and cancel requests.
    pub redis: redis::Client,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn TaskStream>,
        publisher: Arc<dyn ProgressPublisher>,
        redis: redis::Client,
    ) -> Self {
        Self {
            store,
            queue,
            publisher,
            redis,
        }
    }
}
