//! SQLite Database
//!
//! Embedded board store using rusqlite with r2d2 connection pooling. Holds
//! repositories, projects, task records and key/value settings, and
//! implements [`TaskStore`] for the orchestrator.

use async_trait::async_trait;
use board_runner_core::{BoardTaskStatus, LogEntry};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::models::settings::ExecutionSettings;
use crate::models::task::{Project, Repository, TaskRecord, TaskUpdate};
use crate::storage::task_store::TaskStore;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::database_path;

/// Settings key holding the JSON-encoded [`ExecutionSettings`].
pub const EXECUTION_SETTINGS_KEY: &str = "execution_settings";

const TASK_COLUMNS: &str = "id, title, description, status, project_id, batch_id, session_id,
    labels, execution_started_at, execution_paused_at, execution_elapsed_ms,
    execution_progress, pr_url, outcome, execution_logs";

/// Raw task row from the database
#[derive(Debug, Clone)]
struct TaskRow {
    id: String,
    title: String,
    description: Option<String>,
    status: String,
    project_id: Option<String>,
    batch_id: Option<String>,
    session_id: Option<String>,
    labels: String,
    execution_started_at: Option<String>,
    execution_paused_at: Option<String>,
    execution_elapsed_ms: Option<i64>,
    execution_progress: Option<i64>,
    pr_url: Option<String>,
    outcome: Option<String>,
    execution_logs: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            project_id: row.get(4)?,
            batch_id: row.get(5)?,
            session_id: row.get(6)?,
            labels: row.get(7)?,
            execution_started_at: row.get(8)?,
            execution_paused_at: row.get(9)?,
            execution_elapsed_ms: row.get(10)?,
            execution_progress: row.get(11)?,
            pr_url: row.get(12)?,
            outcome: row.get(13)?,
            execution_logs: row.get(14)?,
        })
    }

    fn into_record(self) -> AppResult<TaskRecord> {
        let status = BoardTaskStatus::parse(&self.status).ok_or_else(|| {
            AppError::database(format!("Unknown task status '{}' on {}", self.status, self.id))
        })?;
        let labels: Vec<String> = serde_json::from_str(&self.labels)?;
        let execution_logs: Vec<LogEntry> = serde_json::from_str(&self.execution_logs)?;
        Ok(TaskRecord {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            project_id: self.project_id,
            batch_id: self.batch_id,
            session_id: self.session_id,
            labels,
            execution_started_at: parse_timestamp(self.execution_started_at)?,
            execution_paused_at: parse_timestamp(self.execution_paused_at)?,
            execution_elapsed_ms: self.execution_elapsed_ms.map(|v| v.max(0) as u64),
            execution_progress: self.execution_progress.map(|v| v.clamp(0, 100) as u8),
            pr_url: self.pr_url,
            outcome: self.outcome,
            execution_logs,
        })
    }
}

fn parse_timestamp(value: Option<String>) -> AppResult<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| AppError::database(format!("Invalid timestamp '{}': {}", v, e)))
        })
        .transpose()
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        full_name: row.get(3)?,
        clone_url: row.get(4)?,
        default_branch: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database service for managing SQLite operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create a database from an existing connection pool.
    pub fn from_pool(pool: DbPool) -> AppResult<Self> {
        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database for testing.
    pub fn new_in_memory() -> AppResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;
        Self::from_pool(pool)
    }

    /// Create a new database instance at the default location
    pub fn new() -> AppResult<Self> {
        let db_path = database_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;
        Self::from_pool(pool)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> AppResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                name TEXT NOT NULL,
                full_name TEXT NOT NULL,
                clone_url TEXT NOT NULL,
                default_branch TEXT NOT NULL DEFAULT 'main',
                is_active INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repository_id TEXT REFERENCES repositories(id),
                local_path TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'todo',
                project_id TEXT REFERENCES projects(id),
                batch_id TEXT,
                session_id TEXT,
                labels TEXT NOT NULL DEFAULT '[]',
                execution_started_at TEXT,
                execution_paused_at TEXT,
                execution_elapsed_ms INTEGER,
                execution_progress INTEGER,
                pr_url TEXT,
                outcome TEXT,
                execution_logs TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_batch ON tasks(batch_id)",
            [],
        )?;

        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Get a setting value by key
    pub fn get_setting(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.get_connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a setting value
    pub fn set_setting(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    /// Persist board-level execution settings
    pub fn save_execution_settings(&self, settings: &ExecutionSettings) -> AppResult<()> {
        let json = serde_json::to_string(settings)?;
        self.set_setting(EXECUTION_SETTINGS_KEY, &json)
    }

    /// Read execution settings, falling back to defaults when unset
    pub fn execution_settings(&self) -> AppResult<ExecutionSettings> {
        let settings = match self.get_setting(EXECUTION_SETTINGS_KEY)? {
            Some(json) => serde_json::from_str::<ExecutionSettings>(&json)?,
            None => ExecutionSettings::default(),
        };
        Ok(settings.normalized())
    }

    // ========================================================================
    // Repositories & Projects
    // ========================================================================

    /// Insert or replace a repository record
    pub fn upsert_repository(&self, repo: &Repository) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO repositories (id, user_id, name, full_name, clone_url, default_branch, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                user_id = ?2, name = ?3, full_name = ?4, clone_url = ?5,
                default_branch = ?6, is_active = ?7",
            params![
                repo.id,
                repo.user_id,
                repo.name,
                repo.full_name,
                repo.clone_url,
                repo.default_branch,
                repo.is_active as i64
            ],
        )?;
        Ok(())
    }

    /// Get a repository by id
    pub fn repository(&self, id: &str) -> AppResult<Option<Repository>> {
        let conn = self.get_connection()?;
        let repo = conn
            .query_row(
                "SELECT id, user_id, name, full_name, clone_url, default_branch, is_active
                 FROM repositories WHERE id = ?1",
                params![id],
                repository_from_row,
            )
            .optional()?;
        Ok(repo)
    }

    /// Get the active repository for a user (or the shared one)
    pub fn active_repository_for(&self, user_id: Option<&str>) -> AppResult<Option<Repository>> {
        let conn = self.get_connection()?;
        let repo = match user_id {
            Some(user) => conn
                .query_row(
                    "SELECT id, user_id, name, full_name, clone_url, default_branch, is_active
                     FROM repositories WHERE user_id = ?1 AND is_active = 1 LIMIT 1",
                    params![user],
                    repository_from_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id, user_id, name, full_name, clone_url, default_branch, is_active
                     FROM repositories WHERE user_id IS NULL AND is_active = 1 LIMIT 1",
                    [],
                    repository_from_row,
                )
                .optional()?,
        };
        Ok(repo)
    }

    /// Insert or replace a project record
    pub fn upsert_project(&self, project: &Project) -> AppResult<()> {
        let conn = self.get_connection()?;
        let local_path = project
            .local_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        conn.execute(
            "INSERT INTO projects (id, name, repository_id, local_path) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, repository_id = ?3, local_path = ?4",
            params![project.id, project.name, project.repository_id, local_path],
        )?;
        Ok(())
    }

    /// Get a project by id
    pub fn project(&self, id: &str) -> AppResult<Option<Project>> {
        let conn = self.get_connection()?;
        let project = conn
            .query_row(
                "SELECT id, name, repository_id, local_path FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        repository_id: row.get(2)?,
                        local_path: row.get::<_, Option<String>>(3)?.map(Into::into),
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Insert or replace a whole task record
    pub fn save_task(&self, task: &TaskRecord) -> AppResult<()> {
        let conn = self.get_connection()?;
        Self::write_task(&conn, task)
    }

    /// Get a task by id
    pub fn task(&self, id: &str) -> AppResult<Option<TaskRecord>> {
        let conn = self.get_connection()?;
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()?;
        row.map(TaskRow::into_record).transpose()
    }

    /// Apply a partial update inside a transaction
    pub fn apply_task_update(&self, id: &str, update: TaskUpdate) -> AppResult<TaskRecord> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let mut record = tx
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()?
            .ok_or_else(|| AppError::not_found(format!("Task {}", id)))?
            .into_record()?;
        update.apply_to(&mut record);
        Self::write_task(&tx, &record)?;
        tx.commit()?;
        debug!(task_id = %id, status = record.status.as_str(), "task record updated");
        Ok(record)
    }

    /// Set `batch_id` on several tasks at once
    pub fn set_batch_id(&self, task_ids: &[String], batch_id: Option<&str>) -> AppResult<()> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        for id in task_ids {
            tx.execute(
                "UPDATE tasks SET batch_id = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![batch_id, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn write_task(conn: &rusqlite::Connection, task: &TaskRecord) -> AppResult<()> {
        let labels = serde_json::to_string(&task.labels)?;
        let logs = serde_json::to_string(&task.execution_logs)?;
        conn.execute(
            "INSERT INTO tasks (id, title, description, status, project_id, batch_id, session_id,
                labels, execution_started_at, execution_paused_at, execution_elapsed_ms,
                execution_progress, pr_url, outcome, execution_logs, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                title = ?2, description = ?3, status = ?4, project_id = ?5, batch_id = ?6,
                session_id = ?7, labels = ?8, execution_started_at = ?9,
                execution_paused_at = ?10, execution_elapsed_ms = ?11,
                execution_progress = ?12, pr_url = ?13, outcome = ?14,
                execution_logs = ?15, updated_at = CURRENT_TIMESTAMP",
            params![
                task.id,
                task.title,
                task.description,
                task.status.as_str(),
                task.project_id,
                task.batch_id,
                task.session_id,
                labels,
                task.execution_started_at.map(|t| t.to_rfc3339()),
                task.execution_paused_at.map(|t| t.to_rfc3339()),
                task.execution_elapsed_ms.map(|v| v as i64),
                task.execution_progress.map(i64::from),
                task.pr_url,
                task.outcome,
                logs
            ],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn get_task(&self, task_id: &str) -> AppResult<Option<TaskRecord>> {
        self.task(task_id)
    }

    async fn get_project(&self, project_id: &str) -> AppResult<Option<Project>> {
        self.project(project_id)
    }

    async fn get_repository(&self, repository_id: &str) -> AppResult<Option<Repository>> {
        self.repository(repository_id)
    }

    async fn active_repository(&self, user_id: Option<&str>) -> AppResult<Option<Repository>> {
        self.active_repository_for(user_id)
    }

    async fn update_task(&self, task_id: &str, update: TaskUpdate) -> AppResult<TaskRecord> {
        self.apply_task_update(task_id, update)
    }

    async fn assign_batch(&self, task_ids: &[String], batch_id: &str) -> AppResult<()> {
        self.set_batch_id(task_ids, Some(batch_id))
    }

    async fn load_settings(&self) -> AppResult<ExecutionSettings> {
        self.execution_settings()
    }
}
