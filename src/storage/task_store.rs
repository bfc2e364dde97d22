//! Durable Store Seam
//!
//! The orchestrator reads task, project and repository records and writes
//! execution results back through this trait. [`crate::storage::Database`]
//! is the SQLite implementation; tests substitute their own.

use async_trait::async_trait;

use crate::models::settings::ExecutionSettings;
use crate::models::task::{Project, Repository, TaskRecord, TaskUpdate};
use crate::utils::error::AppResult;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: &str) -> AppResult<Option<TaskRecord>>;

    async fn get_project(&self, project_id: &str) -> AppResult<Option<Project>>;

    async fn get_repository(&self, repository_id: &str) -> AppResult<Option<Repository>>;

    /// The repository marked active for a user (or the shared one when
    /// `user_id` is `None`).
    async fn active_repository(&self, user_id: Option<&str>) -> AppResult<Option<Repository>>;

    /// Apply a partial update and return the stored record.
    async fn update_task(&self, task_id: &str, update: TaskUpdate) -> AppResult<TaskRecord>;

    /// Stamp a batch id onto every listed task.
    async fn assign_batch(&self, task_ids: &[String], batch_id: &str) -> AppResult<()>;

    /// Board-level execution settings, already normalized.
    async fn load_settings(&self) -> AppResult<ExecutionSettings>;
}
