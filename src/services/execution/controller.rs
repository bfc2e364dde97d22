//! Task Execution Controller
//!
//! Single-task path: prepare a private checkout (or reuse a local one), run
//! one agent session on a `<namespace>/<taskId>` branch, then commit, push
//! and open a pull request. Enforces the board's parallel limit and a
//! per-execution timeout that goes through the regular cancel path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use board_runner_core::{BoardEvent, BoardTaskStatus, ExecutionProgress, ExecutionStatus, LogEntry};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::router::{Activity, AgentEventRouter, SessionHandler, SessionOutcome};
use crate::models::credential::Credential;
use crate::models::execution::ExecutionSnapshot;
use crate::models::task::{Repository, TaskRecord, TaskUpdate};
use crate::services::broadcast::ProgressSink;
use crate::services::claims::{ClaimOwner, TaskClaims};
use crate::services::github::{PullRequestHost, PullRequestRequest};
use crate::services::runtime::{AgentRuntime, ModelRef};
use crate::services::worktree::WorktreeManager;
use crate::storage::TaskStore;
use crate::utils::error::{AppError, AppResult};
use crate::utils::text::{commit_message, sanitize_output};

/// Progress shown for a live execution never reaches this
const MAX_ESTIMATED_PROGRESS: u8 = 95;

/// Rough completion estimate for display: tool calls count up to 40 points,
/// edited files up to 30 and elapsed minutes up to 20, capped at 95.
pub fn estimate_progress(tools_executed: u32, files_changed: u32, elapsed: Duration) -> u8 {
    let tools = (tools_executed as f64 * 5.0).min(40.0);
    let files = (files_changed as f64 * 10.0).min(30.0);
    let minutes = (elapsed.as_secs_f64() / 60.0 * 3.0).min(20.0);
    ((tools + files + minutes).round() as u8).min(MAX_ESTIMATED_PROGRESS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    User,
    Timeout(Duration),
}

/// Where the agent works.
#[derive(Debug, Clone)]
enum CheckoutTarget {
    /// Project pinned to a directory on this machine
    Local {
        path: PathBuf,
        repository: Option<Repository>,
    },
    /// Private clone of a hosted repository
    Managed(Repository),
}

impl CheckoutTarget {
    fn repository(&self) -> Option<&Repository> {
        match self {
            CheckoutTarget::Local { repository, .. } => repository.as_ref(),
            CheckoutTarget::Managed(repository) => Some(repository),
        }
    }
}

struct Execution {
    title: String,
    description: Option<String>,
    repository: Option<Repository>,
    credential: Option<Credential>,
    session_id: Option<String>,
    repo_path: Option<PathBuf>,
    branch: String,
    status: ExecutionStatus,
    cancelled: bool,
    files_changed: u32,
    tools_executed: u32,
    started_at: DateTime<Utc>,
    logs: Vec<LogEntry>,
    timeout: Option<JoinHandle<()>>,
}

impl Execution {
    fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    fn estimate(&self) -> u8 {
        estimate_progress(self.tools_executed, self.files_changed, self.elapsed())
    }
}

#[derive(Default)]
struct ControllerState {
    executions: HashMap<String, Execution>,
    /// session id → task id
    sessions: HashMap<String, String>,
}

/// What the completion handler needs, copied out of the lock.
struct Delivery {
    title: String,
    description: Option<String>,
    repository: Option<Repository>,
    credential: Option<Credential>,
    repo_path: PathBuf,
    branch: String,
    files_changed: u32,
    tools_executed: u32,
    elapsed: Duration,
}

/// Drives single-task executions
#[derive(Clone)]
pub struct TaskExecutionController {
    store: Arc<dyn TaskStore>,
    runtime: Arc<dyn AgentRuntime>,
    worktrees: WorktreeManager,
    prs: Arc<dyn PullRequestHost>,
    sink: Arc<dyn ProgressSink>,
    router: AgentEventRouter,
    claims: TaskClaims,
    timeout: Duration,
    state: Arc<Mutex<ControllerState>>,
}

impl TaskExecutionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        runtime: Arc<dyn AgentRuntime>,
        worktrees: WorktreeManager,
        prs: Arc<dyn PullRequestHost>,
        sink: Arc<dyn ProgressSink>,
        router: AgentEventRouter,
        claims: TaskClaims,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            worktrees,
            prs,
            sink,
            router,
            claims,
            timeout,
            state: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_running(&self, task_id: &str) -> bool {
        self.state().executions.contains_key(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.state().executions.len()
    }

    pub fn execution_status(&self, task_id: &str) -> Option<ExecutionSnapshot> {
        let state = self.state();
        let execution = state.executions.get(task_id)?;
        Some(ExecutionSnapshot {
            task_id: task_id.to_string(),
            repository_id: execution.repository.as_ref().map(|r| r.id.clone()),
            session_id: execution.session_id.clone(),
            repo_path: execution.repo_path.clone(),
            branch: execution.branch.clone(),
            status: execution.status,
            cancelled: execution.cancelled,
            files_changed: execution.files_changed,
            tools_executed: execution.tools_executed,
            started_at: execution.started_at,
            elapsed_ms: execution.elapsed().as_millis() as u64,
            estimated_progress: execution.estimate(),
            log_count: execution.logs.len(),
        })
    }

    pub fn execution_logs(&self, task_id: &str) -> Vec<LogEntry> {
        self.state()
            .executions
            .get(task_id)
            .map(|e| e.logs.clone())
            .unwrap_or_default()
    }

    pub fn find_task_by_session(&self, session_id: &str) -> Option<String> {
        self.state().sessions.get(session_id).cloned()
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Start executing a task. Returns once the prompt has been handed to a
    /// background task; completion arrives through the event router.
    pub async fn execute_task(
        &self,
        task_id: &str,
        user_id: Option<&str>,
        credential: Option<Credential>,
    ) -> AppResult<()> {
        if self.is_running(task_id) {
            return Err(AppError::AlreadyRunning(task_id.to_string()));
        }
        if let Some(owner) = self.claims.owner(task_id) {
            return Err(AppError::TaskClaimed {
                task_id: task_id.to_string(),
                owner: owner.to_string(),
            });
        }

        let settings = self.store.load_settings().await?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Task {}", task_id)))?;
        let target = self.resolve_target(&task, user_id).await?;
        let branch = self.worktrees.branch_for_task(task_id);

        {
            let mut state = self.state();
            if state.executions.contains_key(task_id) {
                return Err(AppError::AlreadyRunning(task_id.to_string()));
            }
            if state.executions.len() >= settings.parallel_limit {
                return Err(AppError::ParallelLimitReached(settings.parallel_limit));
            }
            self.claims.claim(&[task_id.to_string()], ClaimOwner::Execution)?;
            state.executions.insert(
                task_id.to_string(),
                Execution {
                    title: task.title.clone(),
                    description: task.description.clone(),
                    repository: target.repository().cloned(),
                    credential: credential.clone(),
                    session_id: None,
                    repo_path: None,
                    branch: branch.clone(),
                    status: ExecutionStatus::Cloning,
                    cancelled: false,
                    files_changed: 0,
                    tools_executed: 0,
                    started_at: Utc::now(),
                    logs: Vec::new(),
                    timeout: None,
                },
            );
        }

        match self.start(&task, &target, &branch, credential.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(task_id, error = %e, "failed to start execution");
                let message = sanitize_output(&e.to_string());
                self.log(task_id, LogEntry::error("Execution failed to start").with_details(message.clone()));
                self.publish_progress(ExecutionProgress::new(task_id, ExecutionStatus::Error, message));
                self.finish(task_id).await;
                Err(e)
            }
        }
    }

    async fn resolve_target(&self, task: &TaskRecord, user_id: Option<&str>) -> AppResult<CheckoutTarget> {
        if let Some(project_id) = &task.project_id {
            if let Some(project) = self.store.get_project(project_id).await? {
                let repository = match &project.repository_id {
                    Some(id) => self.store.get_repository(id).await?,
                    None => None,
                };
                if let Some(path) = project.local_path {
                    return Ok(CheckoutTarget::Local { path, repository });
                }
                if let Some(repository) = repository {
                    return Ok(CheckoutTarget::Managed(repository));
                }
            }
        }
        self.store
            .active_repository(user_id)
            .await?
            .map(CheckoutTarget::Managed)
            .ok_or(AppError::NoActiveRepository)
    }

    async fn start(
        &self,
        task: &TaskRecord,
        target: &CheckoutTarget,
        branch: &str,
        credential: Option<&Credential>,
    ) -> AppResult<()> {
        let task_id = task.id.as_str();

        let repo_path = match target {
            CheckoutTarget::Local { path, .. } => {
                self.publish_progress(ExecutionProgress::new(
                    task_id,
                    ExecutionStatus::Cloning,
                    "Using local repository...",
                ));
                self.worktrees.use_local_checkout(path, branch).await?
            }
            CheckoutTarget::Managed(repository) => {
                self.publish_progress(ExecutionProgress::new(
                    task_id,
                    ExecutionStatus::Cloning,
                    "Cloning repository...",
                ));
                self.worktrees
                    .prepare_checkout(
                        &repository.name,
                        task_id,
                        &repository.clone_url,
                        &repository.default_branch,
                        branch,
                        credential,
                    )
                    .await?
            }
        };

        self.publish_progress(ExecutionProgress::new(
            task_id,
            ExecutionStatus::Executing,
            "Starting agent...",
        ));
        let session_id = self.runtime.create_session(&repo_path, &task.title).await?;

        let started_at = Utc::now();
        let registered = {
            let mut state = self.state();
            let ControllerState {
                executions,
                sessions,
            } = &mut *state;
            match executions.get_mut(task_id) {
                Some(execution) if !execution.cancelled => {
                    execution.session_id = Some(session_id.clone());
                    execution.repo_path = Some(repo_path.clone());
                    execution.status = ExecutionStatus::Executing;
                    execution.started_at = started_at;
                    execution.timeout = Some(self.spawn_timeout(task_id));
                    sessions.insert(session_id.clone(), task_id.to_string());
                    true
                }
                _ => false,
            }
        };
        if !registered {
            info!(task_id, "cancelled while preparing, aborting new session");
            if let Err(e) = self.runtime.abort_session(&session_id).await {
                debug!(task_id, error = %e, "abort after cancel failed");
            }
            return Ok(());
        }
        info!(task_id, %session_id, path = %repo_path.display(), "agent session started");

        match target {
            CheckoutTarget::Local { .. } => {
                self.log(task_id, LogEntry::info(format!("Using local repository: {}", repo_path.display())));
            }
            CheckoutTarget::Managed(_) => {
                self.log(task_id, LogEntry::info("Repository cloned successfully"));
                self.log(task_id, LogEntry::info(format!("Branch created: {}", branch)));
            }
        }
        self.log(task_id, LogEntry::info("Agent session started"));

        // attach before any further await so a cancel from here on finds the
        // route and releases it
        let handler: Arc<dyn SessionHandler> = Arc::new(self.clone());
        self.router.attach(task_id, &session_id, handler).await;

        self.update_record(
            task_id,
            TaskUpdate::status(BoardTaskStatus::InProgress)
                .session(Some(session_id.clone()))
                .started_at(started_at)
                .paused_at(None)
                .progress(Some(0))
                .batch(None),
        )
        .await;

        let model = match self.runtime.current_model().await {
            Ok(Some(spec)) => match ModelRef::parse(&spec) {
                Some(model) => {
                    self.log(task_id, LogEntry::info(format!("Using model: {}", spec)));
                    Some(model)
                }
                None => None,
            },
            Ok(None) => None,
            Err(e) => {
                debug!(task_id, error = %e, "could not read model config");
                None
            }
        };

        if !self.owns_session(task_id, &session_id) {
            info!(task_id, %session_id, "cancelled while starting, prompt not sent");
            self.router.detach(task_id, &session_id);
            if !self.is_running(task_id) {
                // the in-progress write above may have landed after the cancel's
                self.update_record(
                    task_id,
                    TaskUpdate::status(BoardTaskStatus::Cancelled)
                        .session(None)
                        .paused_at(Some(Utc::now())),
                )
                .await;
            }
            return Ok(());
        }

        let prompt = task.prompt(true);
        let controller = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            if !controller.owns_session(&task_id, &session_id) {
                debug!(%task_id, "execution ended before the prompt went out");
                return;
            }
            match controller
                .runtime
                .send_prompt(&session_id, &prompt, model.as_ref())
                .await
            {
                Ok(()) => controller.on_prompt_sent(&task_id),
                Err(e) => controller.on_prompt_failed(&task_id, e).await,
            }
        });
        Ok(())
    }

    fn spawn_timeout(&self, task_id: &str) -> JoinHandle<()> {
        let controller = self.clone();
        let task_id = task_id.to_string();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // detach our own handle so the cancel path does not abort us
            if let Some(execution) = controller.state().executions.get_mut(&task_id) {
                execution.timeout = None;
            }
            warn!(%task_id, "execution timed out");
            if let Err(e) = controller.cancel(&task_id, CancelReason::Timeout(timeout)).await {
                debug!(%task_id, error = %e, "timeout fired after execution ended");
            }
        })
    }

    fn on_prompt_sent(&self, task_id: &str) {
        if !self.is_running(task_id) {
            return;
        }
        self.router.acknowledge_prompt(task_id);
        self.log(task_id, LogEntry::info("Task prompt sent to agent"));
    }

    async fn on_prompt_failed(&self, task_id: &str, err: AppError) {
        if !self.is_live(task_id) || !self.router.mark_terminal(task_id) {
            return;
        }
        error!(task_id, error = %err, "prompt failed");
        let headline = err.user_hint();
        self.log(task_id, LogEntry::error(headline).with_details(sanitize_output(&err.to_string())));
        self.publish_progress(ExecutionProgress::new(task_id, ExecutionStatus::Error, headline));
        self.update_record(task_id, TaskUpdate::status(BoardTaskStatus::Cancelled).session(None))
            .await;
        self.finish(task_id).await;
    }

    /// The live, uncancelled execution of `task_id` runs `session_id`.
    fn owns_session(&self, task_id: &str, session_id: &str) -> bool {
        self.state()
            .executions
            .get(task_id)
            .is_some_and(|e| !e.cancelled && e.session_id.as_deref() == Some(session_id))
    }

    fn is_live(&self, task_id: &str) -> bool {
        self.state()
            .executions
            .get(task_id)
            .map(|e| !e.cancelled)
            .unwrap_or(false)
    }

    // ========================================================================
    // Completion
    // ========================================================================

    async fn handle_completion(&self, task_id: &str) {
        let delivery = {
            let mut state = self.state();
            let Some(execution) = state.executions.get_mut(task_id) else {
                return;
            };
            if execution.cancelled {
                return;
            }
            let Some(repo_path) = execution.repo_path.clone() else {
                return;
            };
            execution.status = ExecutionStatus::Committing;
            if let Some(timeout) = execution.timeout.take() {
                timeout.abort();
            }
            Delivery {
                title: execution.title.clone(),
                description: execution.description.clone(),
                repository: execution.repository.clone(),
                credential: execution.credential.clone(),
                repo_path,
                branch: execution.branch.clone(),
                files_changed: execution.files_changed,
                tools_executed: execution.tools_executed,
                elapsed: execution.elapsed(),
            }
        };

        self.publish_progress(ExecutionProgress::new(
            task_id,
            ExecutionStatus::Committing,
            "Committing changes...",
        ));
        self.log(task_id, LogEntry::info("Agent finished, committing changes..."));

        match self.deliver(task_id, &delivery).await {
            Ok((pr_url, outcome)) => {
                info!(task_id, ?pr_url, "execution complete");
                self.update_record(
                    task_id,
                    TaskUpdate::status(BoardTaskStatus::Done)
                        .session(None)
                        .elapsed_ms(delivery.elapsed.as_millis() as u64)
                        .progress(Some(100))
                        .pr_url(pr_url)
                        .outcome(outcome),
                )
                .await;
            }
            Err(e) => {
                error!(task_id, error = %e, "post-execution failed");
                let details = sanitize_output(&e.to_string());
                self.log(task_id, LogEntry::error("Post-execution failed").with_details(details.clone()));
                self.publish_progress(ExecutionProgress::new(
                    task_id,
                    ExecutionStatus::Error,
                    "Post-execution failed",
                ));
                self.update_record(
                    task_id,
                    TaskUpdate::status(BoardTaskStatus::Cancelled)
                        .session(None)
                        .elapsed_ms(delivery.elapsed.as_millis() as u64)
                        .outcome(format!("Failed: {}", details)),
                )
                .await;
            }
        }
        self.finish(task_id).await;
    }

    /// Commit, push and open the PR. Returns the PR (or compare) URL and the
    /// outcome text.
    async fn deliver(&self, task_id: &str, delivery: &Delivery) -> AppResult<(Option<String>, String)> {
        let committed = self
            .worktrees
            .commit_all(&delivery.repo_path, &commit_message(&delivery.title))
            .await?;

        if !committed {
            self.log(task_id, LogEntry::info("Completed with no changes"));
            self.publish_progress(ExecutionProgress::new(
                task_id,
                ExecutionStatus::Done,
                "Completed with no changes",
            ));
            return Ok((None, "Completed with no changes".to_string()));
        }

        self.worktrees
            .push_task_branch(&delivery.repo_path, &delivery.branch)
            .await?;

        let outcome = format!(
            "{} file{} changed, {} tools executed",
            delivery.files_changed,
            if delivery.files_changed == 1 { "" } else { "s" },
            delivery.tools_executed
        );

        let Some(repository) = &delivery.repository else {
            self.log(task_id, LogEntry::success(format!("Changes pushed to {}", delivery.branch)));
            self.publish_progress(ExecutionProgress::new(
                task_id,
                ExecutionStatus::Done,
                "Changes pushed successfully",
            ));
            return Ok((None, outcome));
        };

        self.set_status(task_id, ExecutionStatus::CreatingPr);
        self.publish_progress(ExecutionProgress::new(
            task_id,
            ExecutionStatus::CreatingPr,
            "Creating pull request...",
        ));
        self.log(task_id, LogEntry::info("Creating pull request..."));

        let request = PullRequestRequest::for_task(
            &repository.full_name,
            &delivery.branch,
            &repository.default_branch,
            &delivery.title,
            delivery.description.as_deref(),
        );
        let result = self
            .prs
            .open_pull_request(&request, delivery.credential.as_ref())
            .await;

        let mut progress = if result.is_compare_link() {
            self.log(task_id, LogEntry::success("Changes pushed! Create PR here:").with_details(result.url.clone()));
            ExecutionProgress::new(task_id, ExecutionStatus::Done, "Changes pushed successfully")
        } else {
            self.log(task_id, LogEntry::success("Pull request created").with_details(result.url.clone()));
            ExecutionProgress::new(task_id, ExecutionStatus::Done, "Pull request created")
        };
        progress.pr_url = Some(result.url.clone());
        progress.is_compare_link = Some(result.is_compare_link());
        self.publish_progress(progress);

        Ok((Some(result.url), outcome))
    }

    async fn handle_session_error(&self, task_id: &str, message: &str) {
        if !self.is_live(task_id) {
            return;
        }
        warn!(task_id, error = message, "agent session failed");
        self.publish_progress(ExecutionProgress::new(
            task_id,
            ExecutionStatus::Error,
            "Execution failed",
        ));
        self.update_record(
            task_id,
            TaskUpdate::status(BoardTaskStatus::Cancelled)
                .session(None)
                .outcome(format!("Failed: {}", sanitize_output(message))),
        )
        .await;
        self.finish(task_id).await;
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Cancel a running execution at the user's request.
    pub async fn cancel_task(&self, task_id: &str) -> AppResult<()> {
        self.cancel(task_id, CancelReason::User).await
    }

    async fn cancel(&self, task_id: &str, reason: CancelReason) -> AppResult<()> {
        let (session_id, elapsed, estimate) = {
            let mut state = self.state();
            let execution = state
                .executions
                .get_mut(task_id)
                .filter(|e| !e.cancelled)
                .ok_or_else(|| AppError::NotRunning(task_id.to_string()))?;
            execution.cancelled = true;
            execution.status = ExecutionStatus::Cancelled;
            if let Some(timeout) = execution.timeout.take() {
                timeout.abort();
            }
            (execution.session_id.clone(), execution.elapsed(), execution.estimate())
        };
        self.router.mark_terminal(task_id);

        let message = match reason {
            CancelReason::User => "Execution cancelled by user".to_string(),
            CancelReason::Timeout(after) => {
                format!("Execution timed out after {} minutes", after.as_secs() / 60)
            }
        };
        info!(task_id, reason = %message, "cancelling execution");
        self.log(task_id, LogEntry::info(message));

        let mut progress = ExecutionProgress::new(task_id, ExecutionStatus::Cancelled, "Execution cancelled");
        progress.elapsed_ms = Some(elapsed.as_millis() as u64);
        progress.estimated_progress = Some(estimate);
        self.publish_progress(progress);

        self.update_record(
            task_id,
            TaskUpdate::status(BoardTaskStatus::Cancelled)
                .session(None)
                .paused_at(Some(Utc::now()))
                .elapsed_ms(elapsed.as_millis() as u64)
                .progress(Some(estimate)),
        )
        .await;

        if let Some(session_id) = session_id {
            if let Err(e) = self.runtime.abort_session(&session_id).await {
                warn!(task_id, %session_id, error = %e, "abort call failed");
            }
        }

        self.finish(task_id).await;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Drop all live state for the task and persist its log.
    async fn finish(&self, task_id: &str) {
        let execution = {
            let mut state = self.state();
            let execution = state.executions.remove(task_id);
            if let Some(session_id) = execution.as_ref().and_then(|e| e.session_id.as_ref()) {
                state.sessions.remove(session_id);
            }
            execution
        };
        self.router.release(task_id);
        if execution.is_some() {
            self.claims.release(task_id, &ClaimOwner::Execution);
        }

        let Some(mut execution) = execution else {
            return;
        };
        if let Some(timeout) = execution.timeout.take() {
            timeout.abort();
        }
        if !execution.logs.is_empty() {
            let update = TaskUpdate::default().logs(std::mem::take(&mut execution.logs));
            if let Err(e) = self.store.update_task(task_id, update).await {
                warn!(task_id, error = %e, "failed to persist execution logs");
            }
        }
        debug!(task_id, "execution cleaned up");
    }

    fn set_status(&self, task_id: &str, status: ExecutionStatus) {
        if let Some(execution) = self.state().executions.get_mut(task_id) {
            execution.status = status;
        }
    }

    fn log(&self, task_id: &str, entry: LogEntry) {
        if let Some(execution) = self.state().executions.get_mut(task_id) {
            execution.logs.push(entry.clone());
        }
        self.sink.publish(BoardEvent::ExecutionLog {
            task_id: task_id.to_string(),
            entry,
        });
    }

    fn publish_progress(&self, progress: ExecutionProgress) {
        self.sink.publish(BoardEvent::ExecutionProgress(progress));
    }

    async fn update_record(&self, task_id: &str, update: TaskUpdate) {
        match self.store.update_task(task_id, update).await {
            Ok(record) => self.sink.publish(BoardEvent::TaskUpdated(record.change())),
            Err(e) => warn!(task_id, error = %e, "failed to update task record"),
        }
    }
}

#[async_trait]
impl SessionHandler for TaskExecutionController {
    fn log(&self, task_id: &str, entry: LogEntry) {
        TaskExecutionController::log(self, task_id, entry);
    }

    fn on_activity(&self, task_id: &str, activity: Activity) {
        let estimate = {
            let mut state = self.state();
            let Some(execution) = state.executions.get_mut(task_id) else {
                return;
            };
            match activity {
                Activity::ToolExecuted => execution.tools_executed += 1,
                Activity::FileEdited => execution.files_changed += 1,
                Activity::Thinking | Activity::ToolRunning(_) => {}
            }
            execution.estimate()
        };

        let message = match &activity {
            Activity::Thinking => "Agent is thinking...".to_string(),
            Activity::ToolRunning(label) => format!("Running: {}", label),
            Activity::ToolExecuted | Activity::FileEdited => return,
        };
        let mut progress = ExecutionProgress::new(task_id, ExecutionStatus::Executing, message);
        progress.estimated_progress = Some(estimate);
        self.publish_progress(progress);
    }

    async fn on_terminal(&self, task_id: &str, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Completed => self.handle_completion(task_id).await,
            SessionOutcome::Failed(message) => self.handle_session_error(task_id, &message).await,
        }
    }
}

impl std::fmt::Debug for TaskExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutionController")
            .field("running", &self.running_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_progress_components() {
        assert_eq!(estimate_progress(0, 0, Duration::ZERO), 0);
        assert_eq!(estimate_progress(2, 1, Duration::ZERO), 20);
        // each component saturates
        assert_eq!(estimate_progress(100, 0, Duration::ZERO), 40);
        assert_eq!(estimate_progress(0, 100, Duration::ZERO), 30);
        assert_eq!(estimate_progress(0, 0, Duration::from_secs(3600)), 20);
    }

    #[test]
    fn test_estimate_progress_never_reaches_completion() {
        assert_eq!(estimate_progress(100, 100, Duration::from_secs(7200)), 90);
        assert!(estimate_progress(u32::MAX, u32::MAX, Duration::from_secs(u64::MAX / 2)) <= 95);
        // 10 minutes = 30 points, capped at 20
        assert_eq!(estimate_progress(8, 3, Duration::from_secs(600)), 90);
    }
}
