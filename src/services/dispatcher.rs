use std::collections::HashMap;
use std::sync::Arc;

use super::handlers::TaskHandler;
use crate::models::task::TaskType;

/// Where a task type is consumed and who handles it.
#[derive(Clone)]
pub struct Route {
    pub stream: String,
    pub group: String,
    pub handler: Arc<dyn TaskHandler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("handler", &self.handler.task_type())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("task type {0} is already registered")]
    Duplicate(TaskType),

    #[error("handler for {handler} cannot be registered under {registered}")]
    HandlerMismatch {
        registered: TaskType,
        handler: TaskType,
    },

    #[error("no handler registered for task type {0}")]
    Unrouted(TaskType),
}

/// Maps task types to their stream, consumer group and handler.
#[derive(Debug, Default)]
pub struct Dispatcher {
    routes: HashMap<TaskType, Route>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        stream: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DispatchError> {
        if handler.task_type() != task_type {
            return Err(DispatchError::HandlerMismatch {
                registered: task_type,
                handler: handler.task_type(),
            });
        }
        if self.routes.contains_key(&task_type) {
            return Err(DispatchError::Duplicate(task_type));
        }

        let route = Route {
            stream: stream.into(),
            group: group.into(),
            handler,
        };
        tracing::debug!(%task_type, stream = %route.stream, group = %route.group, "Registered task route");
        self.routes.insert(task_type, route);
        Ok(())
    }

    pub fn route(&self, task_type: TaskType) -> Result<&Route, DispatchError> {
        self.routes
            .get(&task_type)
            .ok_or(DispatchError::Unrouted(task_type))
    }

    /// Distinct (stream, group) pairs, one consumer loop each.
    pub fn consumer_groups(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .routes
            .values()
            .map(|route| (route.stream.clone(), route.group.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        self.routes.keys().copied().collect()
    }
}
