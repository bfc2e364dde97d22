//! Runner State
//!
//! Builds the shared services once and hands them to whatever transport
//! exposes the runner (HTTP API, CLI).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::models::settings::RunnerConfig;
use crate::services::batch::BatchOrchestrator;
use crate::services::broadcast::{BroadcastHub, ProgressSink};
use crate::services::claims::TaskClaims;
use crate::services::execution::{AgentEventRouter, TaskExecutionController};
use crate::services::github::{GitHubClient, PullRequestHost};
use crate::services::runtime::{AgentRuntime, HttpAgentRuntime};
use crate::services::worktree::WorktreeManager;
use crate::storage::{ConfigService, Database, TaskStore};
use crate::utils::error::AppResult;

/// Everything a transport layer needs
#[derive(Clone)]
pub struct RunnerState {
    config: RunnerConfig,
    database: Database,
    events: BroadcastHub,
    router: AgentEventRouter,
    claims: TaskClaims,
    executions: TaskExecutionController,
    batches: BatchOrchestrator,
}

impl RunnerState {
    /// Load `~/.board-runner/config.json` and open the default database.
    pub fn initialize() -> AppResult<Self> {
        let config = ConfigService::new()?.get_config().clone();
        let database = Database::new()?;
        Self::build(config, database)
    }

    /// Wire the services against an explicit config and database.
    pub fn build(config: RunnerConfig, database: Database) -> AppResult<Self> {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(HttpAgentRuntime::new(&config.agent_base_url)?);
        let prs: Arc<dyn PullRequestHost> = Arc::new(GitHubClient::new(
            config.github_api_url.clone(),
            config.github_web_url.clone(),
        ));
        Ok(Self::with_services(config, database, runtime, prs))
    }

    /// Wire the services around a given runtime and PR host.
    pub fn with_services(
        config: RunnerConfig,
        database: Database,
        runtime: Arc<dyn AgentRuntime>,
        prs: Arc<dyn PullRequestHost>,
    ) -> Self {
        let events = BroadcastHub::default();
        let store: Arc<dyn TaskStore> = Arc::new(database.clone());
        let sink: Arc<dyn ProgressSink> = Arc::new(events.clone());
        let worktrees = WorktreeManager::from_config(&config);
        let claims = TaskClaims::new();
        let router = AgentEventRouter::new(
            runtime.clone(),
            Duration::from_millis(config.delta_flush_ms),
            Duration::from_secs(config.event_retry_secs),
        );

        let executions = TaskExecutionController::new(
            store.clone(),
            runtime.clone(),
            worktrees.clone(),
            prs.clone(),
            sink.clone(),
            router.clone(),
            claims.clone(),
            Duration::from_secs(config.task_timeout_secs),
        );
        let batches = BatchOrchestrator::new(
            store,
            runtime,
            worktrees,
            prs,
            sink,
            router.clone(),
            claims.clone(),
            config.max_batch_tasks,
        );

        info!(
            repos_dir = %config.repos_dir.display(),
            agent = %config.agent_base_url,
            "runner state initialized"
        );
        Self {
            config,
            database,
            events,
            router,
            claims,
            executions,
            batches,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Board events for the client-facing transport.
    pub fn events(&self) -> &BroadcastHub {
        &self.events
    }

    /// Live session routes shared by both execution paths.
    pub fn router(&self) -> &AgentEventRouter {
        &self.router
    }

    /// Which batch or execution currently holds each task.
    pub fn claims(&self) -> &TaskClaims {
        &self.claims
    }

    pub fn executions(&self) -> &TaskExecutionController {
        &self.executions
    }

    pub fn batches(&self) -> &BatchOrchestrator {
        &self.batches
    }
}

impl std::fmt::Debug for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerState")
            .field("config", &self.config)
            .field("executions", &self.executions)
            .field("batches", &self.batches)
            .finish_non_exhaustive()
    }
}
