use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::task::{Task, TaskOutcome};
use crate::services::store::{CancelRequest, ResultStore, StoreError};

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod queries;

/// Task records in the `tasks` table.
#[derive(Debug, Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        queries::insert_task(&self.pool, task).await
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        queries::get_task(&self.pool, task_id).await
    }

    async fn begin(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        queries::begin_task(&self.pool, task_id).await
    }

    async fn record_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        step: &str,
        seq: u64,
    ) -> Result<(), StoreError> {
        queries::update_progress(&self.pool, task_id, progress, step, seq).await
    }

    async fn save_result(&self, outcome: &TaskOutcome) -> Result<bool, StoreError> {
        queries::save_result(&self.pool, outcome).await
    }

    async fn request_cancel(&self, task_id: Uuid) -> Result<Option<CancelRequest>, StoreError> {
        queries::request_cancel(&self.pool, task_id).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
