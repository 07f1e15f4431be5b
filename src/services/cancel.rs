//! Cancellation plumbing.
//!
//! Two signals reach a running task: process shutdown (leave the entry for
//! redelivery) and a per-task cancel request (record a `cancelled` terminal
//! state). [`CancelScope`] carries both into every suspension point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::task_error::TaskError;

#[derive(Debug, Clone)]
pub struct CancelScope {
    shutdown: CancellationToken,
    task: CancellationToken,
}

impl CancelScope {
    pub fn new(shutdown: CancellationToken, task: CancellationToken) -> Self {
        Self { shutdown, task }
    }

    /// A scope nothing will ever cancel.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), CancellationToken::new())
    }

    /// Fails fast if either signal has already fired. Task cancellation wins.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.task.is_cancelled() {
            Err(TaskError::Cancelled)
        } else if self.shutdown.is_cancelled() {
            Err(TaskError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Fire the per-task signal, as a cancel request arriving from outside would.
    pub fn cancel_task(&self) {
        self.task.cancel();
    }

    /// Resolves when either signal fires.
    pub async fn cancelled(&self) -> TaskError {
        tokio::select! {
            biased;
            _ = self.task.cancelled() => TaskError::Cancelled,
            _ = self.shutdown.cancelled() => TaskError::Interrupted,
        }
    }

    /// Run `fut` unless a signal fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, TaskError> {
        tokio::select! {
            biased;
            err = self.cancelled() => Err(err),
            out = fut => Ok(out),
        }
    }
}

/// Per-task cancel tokens for the tasks this process is currently running.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running task. The token is removed when the guard drops.
    pub fn register(&self, task_id: Uuid) -> Registration {
        let token = CancellationToken::new();
        self.lock().insert(task_id, token.clone());
        Registration {
            registry: self.clone(),
            task_id,
            token,
        }
    }

    /// Cancel a running task. Returns false if this process is not running it.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.lock().get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        // The map holds no invariants a panicking holder could break.
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Registration {
    registry: CancelRegistry,
    task_id: Uuid,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.task_id);
    }
}
