//! Batch Orchestrator
//!
//! Runs a set of board tasks in isolated worktrees of one shared mirror,
//! either in parallel up to the batch's concurrency limit or one at a time
//! in queue mode, then hands the completed branches to the merge stage.
//!
//! Batch state lives in memory only. The durable task records are updated
//! as a side effect and every change is broadcast through the progress sink.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use board_runner_core::{BatchMode, BatchStatus, BatchTaskStatus, BoardEvent, BoardTaskStatus, LogEntry};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::models::batch::{Batch, BatchSettings, BatchStatusView, BatchSummary, BatchTask};
use crate::models::credential::Credential;
use crate::models::task::{Repository, TaskUpdate};
use crate::services::broadcast::ProgressSink;
use crate::services::claims::{ClaimOwner, TaskClaims};
use crate::services::execution::{AgentEventRouter, SessionHandler, SessionOutcome};
use crate::services::github::PullRequestHost;
use crate::services::runtime::AgentRuntime;
use crate::services::worktree::WorktreeManager;
use crate::storage::TaskStore;
use crate::utils::error::{AppError, AppResult};
use crate::utils::text::{commit_message, sanitize_output};

const UNTITLED_TASK: &str = "Untitled task";

/// What `advance_queue` decided while holding the lock.
enum Advance {
    Finalize,
    Start(Vec<String>),
    Idle,
}

/// Coordinates batch execution
#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Arc<dyn TaskStore>,
    runtime: Arc<dyn AgentRuntime>,
    pub(super) worktrees: WorktreeManager,
    pub(super) prs: Arc<dyn PullRequestHost>,
    pub(super) sink: Arc<dyn ProgressSink>,
    router: AgentEventRouter,
    pub(super) claims: TaskClaims,
    max_batch_tasks: usize,
    batches: Arc<RwLock<HashMap<String, Batch>>>,
    /// session id → (batch id, task id)
    sessions: Arc<RwLock<HashMap<String, (String, String)>>>,
}

impl BatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        runtime: Arc<dyn AgentRuntime>,
        worktrees: WorktreeManager,
        prs: Arc<dyn PullRequestHost>,
        sink: Arc<dyn ProgressSink>,
        router: AgentEventRouter,
        claims: TaskClaims,
        max_batch_tasks: usize,
    ) -> Self {
        Self {
            store,
            runtime,
            worktrees,
            prs,
            sink,
            router,
            claims,
            max_batch_tasks: max_batch_tasks.max(1),
            batches: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_batch(&self, batch_id: &str) -> Option<BatchStatusView> {
        self.batches.read().await.get(batch_id).map(Batch::status_view)
    }

    /// Every batch still held in memory, oldest first.
    pub async fn get_active_batches(&self) -> Vec<BatchSummary> {
        let mut summaries: Vec<_> = self
            .batches
            .read()
            .await
            .values()
            .map(Batch::summary)
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// (batch id, task id) of a live batch session.
    pub async fn find_by_session(&self, session_id: &str) -> Option<(String, String)> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Forget terminal batches that finished more than `retention` ago.
    /// Returns how many were dropped.
    pub async fn prune_finished(&self, retention: ChronoDuration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut batches = self.batches.write().await;
        let before = batches.len();
        batches.retain(|_, batch| {
            !(batch.status.is_terminal() && batch.completed_at.is_some_and(|at| at <= cutoff))
        });
        let pruned = before - batches.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished batches");
        }
        pruned
    }

    // ========================================================================
    // Create / start
    // ========================================================================

    /// Register a new batch on the user's active repository. The batch is
    /// created `pending`; call [`start_batch`](Self::start_batch) to run it.
    /// Fails with [`AppError::TaskClaimed`] if any task is already in a live
    /// batch or a single-task execution.
    pub async fn create_batch(
        &self,
        mut task_ids: Vec<String>,
        mode: BatchMode,
        user_id: Option<&str>,
        credential: Option<Credential>,
    ) -> AppResult<BatchStatusView> {
        let mut seen = HashSet::new();
        task_ids.retain(|id| seen.insert(id.clone()));

        if task_ids.is_empty() {
            return Err(AppError::validation("A batch needs at least one task"));
        }
        if task_ids.len() > self.max_batch_tasks {
            return Err(AppError::validation(format!(
                "A batch can hold at most {} tasks",
                self.max_batch_tasks
            )));
        }

        // claimed before any side effect; a task in a live batch or a running
        // execution is rejected here
        let batch_id = uuid::Uuid::new_v4().to_string();
        self.claims
            .claim(&task_ids, ClaimOwner::Batch(batch_id.clone()))?;

        match self
            .register_batch(&batch_id, task_ids, mode, user_id, credential)
            .await
        {
            Ok(view) => Ok(view),
            Err(e) => {
                self.claims.release_batch(&batch_id);
                Err(e)
            }
        }
    }

    async fn register_batch(
        &self,
        batch_id: &str,
        task_ids: Vec<String>,
        mode: BatchMode,
        user_id: Option<&str>,
        credential: Option<Credential>,
    ) -> AppResult<BatchStatusView> {
        let repository = self
            .store
            .active_repository(user_id)
            .await?
            .ok_or(AppError::NoActiveRepository)?;
        let settings = BatchSettings::from(&self.store.load_settings().await?);

        let main_repo_path = self
            .worktrees
            .ensure_main_repo(&repository.id, &repository.clone_url, credential.as_ref())
            .await?;

        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in &task_ids {
            let title = match self.store.get_task(task_id).await? {
                Some(record) if !record.title.trim().is_empty() => record.title,
                _ => UNTITLED_TASK.to_string(),
            };
            tasks.push(BatchTask::new(
                task_id.clone(),
                title,
                self.worktrees.branch_for_task(task_id),
            ));
        }

        let batch = Batch {
            id: batch_id.to_string(),
            batch_branch: self.worktrees.batch_branch(batch_id),
            repository,
            mode,
            status: BatchStatus::Pending,
            tasks,
            settings,
            main_repo_path,
            pr_url: None,
            user_id: user_id.map(str::to_string),
            credential,
            created_at: Utc::now(),
            completed_at: None,
        };

        self.store.assign_batch(&task_ids, batch_id).await?;

        let view = batch.status_view();
        let event = BoardEvent::BatchCreated {
            batch_id: batch_id.to_string(),
            mode,
            status: batch.status,
            tasks: batch.briefs(),
        };
        self.batches.write().await.insert(batch_id.to_string(), batch);

        info!(%batch_id, %mode, tasks = task_ids.len(), "batch created");
        self.sink.publish(event);
        Ok(view)
    }

    /// Move a pending batch to `running` and start its first tasks.
    pub async fn start_batch(&self, batch_id: &str) -> AppResult<()> {
        let (started, event) = {
            let mut batches = self.batches.write().await;
            let batch = batches
                .get_mut(batch_id)
                .ok_or_else(|| AppError::not_found(format!("Batch {}", batch_id)))?;
            if batch.status != BatchStatus::Pending {
                return Err(AppError::validation(format!(
                    "Batch {} is already {}",
                    batch_id, batch.status
                )));
            }
            batch.status = BatchStatus::Running;

            let slots = match batch.mode {
                BatchMode::Parallel => batch.settings.max_concurrent.min(batch.tasks.len()),
                BatchMode::Queue => 1,
            };
            let started: Vec<String> = (0..slots).filter_map(|_| claim_next(batch)).collect();
            let event = BoardEvent::BatchStarted {
                batch_id: batch_id.to_string(),
                mode: batch.mode,
                tasks: batch.briefs(),
            };
            (started, event)
        };

        info!(batch_id, started = started.len(), "batch started");
        self.sink.publish(event);
        for task_id in started {
            self.spawn_task(batch_id, &task_id);
        }
        Ok(())
    }

    /// Start the next queued task of a running batch.
    pub async fn approve_next_task(&self, batch_id: &str) -> AppResult<()> {
        let task_id = {
            let mut batches = self.batches.write().await;
            let batch = batches
                .get_mut(batch_id)
                .ok_or_else(|| AppError::not_found(format!("Batch {}", batch_id)))?;
            if batch.status != BatchStatus::Running {
                return Err(AppError::validation(format!(
                    "Batch {} is {}",
                    batch_id, batch.status
                )));
            }
            if batch.next_queued().is_none() {
                return Err(AppError::NoQueuedTasks);
            }
            let limit = concurrency_limit(batch);
            if batch.count(BatchTaskStatus::Running) >= limit {
                return Err(AppError::validation(format!(
                    "Batch {} already has {} running task(s)",
                    batch_id, limit
                )));
            }
            claim_next(batch).ok_or(AppError::NoQueuedTasks)?
        };

        info!(batch_id, %task_id, "next task approved");
        self.spawn_task(batch_id, &task_id);
        Ok(())
    }

    /// Run `start_task` on its own tokio task.
    fn spawn_task(&self, batch_id: &str, task_id: &str) {
        let orchestrator = self.clone();
        let batch_id = batch_id.to_string();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            orchestrator.start_task(&batch_id, &task_id).await;
        });
    }

    async fn start_task(&self, batch_id: &str, task_id: &str) {
        let Some((repository, mode)) = self
            .with_batch(batch_id, |batch| {
                let running = batch
                    .task(task_id)
                    .is_some_and(|t| t.status == BatchTaskStatus::Running);
                (batch.status == BatchStatus::Running && running)
                    .then(|| (batch.repository.clone(), batch.mode))
            })
            .await
            .flatten()
        else {
            debug!(batch_id, task_id, "task no longer startable");
            return;
        };

        if let Err(e) = self.launch(batch_id, task_id, &repository, mode).await {
            error!(batch_id, task_id, error = %e, "failed to start batch task");
            let message = sanitize_output(&e.to_string());
            self.log(
                task_id,
                LogEntry::error(format!("Failed to start task: {}", message)),
            );
            self.handle_task_complete(batch_id, task_id, SessionOutcome::Failed(message))
                .await;
        }
    }

    async fn launch(
        &self,
        batch_id: &str,
        task_id: &str,
        repository: &Repository,
        mode: BatchMode,
    ) -> AppResult<()> {
        let worktree = self
            .worktrees
            .create_worktree(&repository.id, batch_id, task_id, &repository.default_branch)
            .await?;

        let title = {
            let mut batches = self.batches.write().await;
            let Some(task) = batches
                .get_mut(batch_id)
                .and_then(|b| b.task_mut(task_id))
                .filter(|t| t.status == BatchTaskStatus::Running)
            else {
                // cancelled while the worktree was created; cleanup_batch removes it
                return Ok(());
            };
            task.worktree_path = Some(worktree.clone());
            task.title.clone()
        };

        let session_id = self.runtime.create_session(&worktree, &title).await?;

        let registered = {
            let mut batches = self.batches.write().await;
            match batches
                .get_mut(batch_id)
                .and_then(|b| b.task_mut(task_id))
                .filter(|t| t.status == BatchTaskStatus::Running)
            {
                Some(task) => {
                    task.session_id = Some(session_id.clone());
                    true
                }
                None => false,
            }
        };
        if !registered {
            info!(batch_id, task_id, "cancelled while preparing, aborting new session");
            if let Err(e) = self.runtime.abort_session(&session_id).await {
                debug!(task_id, error = %e, "abort after cancel failed");
            }
            return Ok(());
        }
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), (batch_id.to_string(), task_id.to_string()));

        // attach before any further await so a cancel from here on finds the
        // route and releases it
        let handler: Arc<dyn SessionHandler> = Arc::new(BatchTaskHandler {
            orchestrator: self.clone(),
            batch_id: batch_id.to_string(),
        });
        self.router.attach(task_id, &session_id, handler).await;

        info!(batch_id, task_id, %session_id, path = %worktree.display(), "batch task session started");
        self.sink.publish(BoardEvent::BatchTaskStarted {
            batch_id: batch_id.to_string(),
            task_id: task_id.to_string(),
            title: title.clone(),
        });
        self.update_record(
            task_id,
            TaskUpdate::status(BoardTaskStatus::InProgress)
                .session(Some(session_id.clone()))
                .started_at(Utc::now())
                .paused_at(None)
                .progress(Some(0)),
        )
        .await;
        self.log(task_id, LogEntry::info(format!("Batch task started in {} mode", mode)));

        let prompt = match self.store.get_task(task_id).await {
            Ok(Some(record)) => record.prompt(false),
            _ => title,
        };

        let state = self
            .with_batch(batch_id, |batch| batch.task(task_id).map(|t| t.status))
            .await
            .flatten();
        match state {
            Some(BatchTaskStatus::Running) => {
                self.spawn_prompt(batch_id, task_id, session_id, prompt);
            }
            Some(BatchTaskStatus::Cancelled) => {
                info!(batch_id, task_id, %session_id, "cancelled while starting, prompt not sent");
                self.release_session(task_id, Some(&session_id)).await;
                // the in-progress write above may have landed after the cancel's
                self.update_record(
                    task_id,
                    TaskUpdate::status(BoardTaskStatus::Cancelled)
                        .session(None)
                        .paused_at(Some(Utc::now())),
                )
                .await;
            }
            _ => {
                debug!(batch_id, task_id, "task settled while starting, prompt not sent");
                self.release_session(task_id, Some(&session_id)).await;
            }
        }
        Ok(())
    }

    /// Send the prompt in the background. A rejected prompt ends the task
    /// through the same terminal claim the event stream uses.
    fn spawn_prompt(&self, batch_id: &str, task_id: &str, session_id: String, prompt: String) {
        let orchestrator = self.clone();
        let batch_id = batch_id.to_string();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            if orchestrator.router.session_for(&task_id).as_deref() != Some(session_id.as_str()) {
                debug!(%batch_id, %task_id, "session released before the prompt went out");
                return;
            }
            match orchestrator
                .runtime
                .send_prompt(&session_id, &prompt, None)
                .await
            {
                Ok(()) => {
                    orchestrator.router.acknowledge_prompt(&task_id);
                    debug!(%batch_id, %task_id, "prompt accepted");
                }
                Err(e) => {
                    if !orchestrator.router.mark_terminal(&task_id) {
                        return;
                    }
                    error!(%batch_id, %task_id, error = %e, "prompt failed");
                    orchestrator.log(
                        &task_id,
                        LogEntry::error(e.user_hint()).with_details(sanitize_output(&e.to_string())),
                    );
                    let message = if e.is_auth_related() {
                        e.user_hint().to_string()
                    } else {
                        sanitize_output(&e.to_string())
                    };
                    orchestrator
                        .handle_task_complete(&batch_id, &task_id, SessionOutcome::Failed(message))
                        .await;
                }
            }
        });
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Settle a running task. Ignores tasks that are no longer running, so
    /// a late event after cancel or a second terminal signal is a no-op.
    pub(super) async fn handle_task_complete(
        &self,
        batch_id: &str,
        task_id: &str,
        outcome: SessionOutcome,
    ) {
        let claimed = {
            let mut batches = self.batches.write().await;
            let Some(batch) = batches.get_mut(batch_id) else {
                return;
            };
            if !batch.status.accepts_task_updates() {
                return;
            }
            match batch.task_mut(task_id) {
                Some(task) if task.status == BatchTaskStatus::Running && !task.settling => {
                    task.settling = true;
                    Some((task.worktree_path.clone(), task.title.clone()))
                }
                _ => None,
            }
        };
        let Some((worktree, title)) = claimed else {
            debug!(batch_id, task_id, "completion ignored");
            return;
        };

        if outcome == SessionOutcome::Completed {
            if let Some(path) = worktree {
                match self.worktrees.commit_all(&path, &commit_message(&title)).await {
                    Ok(true) => info!(batch_id, task_id, "task changes committed"),
                    Ok(false) => debug!(batch_id, task_id, "nothing to commit"),
                    Err(e) => {
                        warn!(batch_id, task_id, error = %e, "commit failed");
                        self.log(
                            task_id,
                            LogEntry::error("Failed to commit changes")
                                .with_details(sanitize_output(&e.to_string())),
                        );
                    }
                }
            }
        }

        let now = Utc::now();
        let settled = {
            let mut batches = self.batches.write().await;
            let Some(batch) = batches.get_mut(batch_id) else {
                return;
            };
            let stop_on_failure = batch.settings.stop_on_failure;
            let Some(task) = batch.task_mut(task_id) else {
                return;
            };
            task.settling = false;
            if task.status != BatchTaskStatus::Running {
                // cancelled while committing
                None
            } else {
                match &outcome {
                    SessionOutcome::Completed => task.status = BatchTaskStatus::Completed,
                    SessionOutcome::Failed(message) => {
                        task.status = BatchTaskStatus::Failed;
                        task.error = Some(message.clone());
                    }
                }
                task.completed_at = Some(now);
                Some((task.session_id.clone(), task.elapsed_ms(now), stop_on_failure))
            }
        };
        let Some((session_id, elapsed_ms, stop_on_failure)) = settled else {
            return;
        };

        self.release_session(task_id, session_id.as_deref()).await;

        let escalate = match outcome {
            SessionOutcome::Completed => {
                info!(batch_id, task_id, "batch task completed");
                self.sink.publish(BoardEvent::BatchTaskCompleted {
                    batch_id: batch_id.to_string(),
                    task_id: task_id.to_string(),
                });
                self.log(task_id, LogEntry::success("Batch task completed"));
                self.update_record(
                    task_id,
                    TaskUpdate::status(BoardTaskStatus::Done)
                        .session(None)
                        .elapsed_ms(elapsed_ms)
                        .progress(Some(100))
                        .outcome("Completed via batch execution"),
                )
                .await;
                false
            }
            SessionOutcome::Failed(message) => {
                warn!(batch_id, task_id, error = %message, "batch task failed");
                self.sink.publish(BoardEvent::BatchTaskFailed {
                    batch_id: batch_id.to_string(),
                    task_id: task_id.to_string(),
                    error: message.clone(),
                });
                self.log(task_id, LogEntry::error(format!("Batch task failed: {}", message)));
                self.update_record(
                    task_id,
                    TaskUpdate::status(BoardTaskStatus::Cancelled)
                        .session(None)
                        .elapsed_ms(elapsed_ms)
                        .outcome(format!("Failed: {}", message)),
                )
                .await;
                stop_on_failure
            }
        };

        if escalate {
            info!(batch_id, task_id, "stop on failure, cancelling batch");
            if let Err(e) = self.cancel_batch(batch_id).await {
                debug!(batch_id, error = %e, "batch already settled");
            }
        } else {
            self.advance_queue(batch_id).await;
        }
    }

    /// Start whatever the batch's mode allows next, or finalize once nothing
    /// is queued or running.
    async fn advance_queue(&self, batch_id: &str) {
        let next = {
            let mut batches = self.batches.write().await;
            let Some(batch) = batches.get_mut(batch_id) else {
                return;
            };
            if batch.status != BatchStatus::Running {
                return;
            }
            if !batch.has_pending_work() {
                batch.status = BatchStatus::Merging;
                Advance::Finalize
            } else {
                let free = concurrency_limit(batch).saturating_sub(batch.count(BatchTaskStatus::Running));
                let may_start = match batch.mode {
                    BatchMode::Parallel => free,
                    BatchMode::Queue if batch.settings.auto_approve => free,
                    BatchMode::Queue => 0,
                };
                let started: Vec<String> = (0..may_start).filter_map(|_| claim_next(batch)).collect();
                if started.is_empty() {
                    Advance::Idle
                } else {
                    Advance::Start(started)
                }
            }
        };

        match next {
            Advance::Finalize => self.finalize_batch(batch_id).await,
            Advance::Start(task_ids) => {
                for task_id in task_ids {
                    debug!(batch_id, %task_id, "advancing queue");
                    self.spawn_task(batch_id, &task_id);
                }
            }
            Advance::Idle => debug!(batch_id, "waiting for approval or running tasks"),
        }
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Cancel every unfinished task and clean up the batch's worktrees.
    pub async fn cancel_batch(&self, batch_id: &str) -> AppResult<()> {
        let (repo_id, affected) = {
            let mut batches = self.batches.write().await;
            let batch = batches
                .get_mut(batch_id)
                .ok_or_else(|| AppError::not_found(format!("Batch {}", batch_id)))?;
            if !batch.status.is_cancellable() {
                return Err(AppError::validation(format!(
                    "Batch {} is {} and can no longer be cancelled",
                    batch_id, batch.status
                )));
            }
            let now = Utc::now();
            batch.status = BatchStatus::Cancelled;
            batch.completed_at = Some(now);

            let mut affected = Vec::new();
            for task in batch.tasks.iter_mut() {
                let was_running = match task.status {
                    BatchTaskStatus::Running => true,
                    BatchTaskStatus::Queued => false,
                    _ => continue,
                };
                task.status = BatchTaskStatus::Cancelled;
                task.completed_at = Some(now);
                affected.push((task.task_id.clone(), task.session_id.clone(), was_running));
            }
            (batch.repository.id.clone(), affected)
        };

        info!(batch_id, tasks = affected.len(), "cancelling batch");
        for (task_id, session_id, was_running) in affected {
            self.stop_task(batch_id, &task_id, session_id.as_deref(), was_running)
                .await;
        }
        self.sink.publish(BoardEvent::BatchCancelled {
            batch_id: batch_id.to_string(),
        });

        self.worktrees.cleanup_batch(&repo_id, batch_id).await;
        self.claims.release_batch(batch_id);
        Ok(())
    }

    /// Cancel one task; the rest of the batch carries on.
    pub async fn cancel_task(&self, batch_id: &str, task_id: &str) -> AppResult<()> {
        let (session_id, was_running) = {
            let mut batches = self.batches.write().await;
            let batch = batches
                .get_mut(batch_id)
                .ok_or_else(|| AppError::not_found(format!("Batch {}", batch_id)))?;
            if !batch.status.accepts_task_updates() {
                return Err(AppError::validation(format!(
                    "Batch {} is {}",
                    batch_id, batch.status
                )));
            }
            let task = batch
                .task_mut(task_id)
                .ok_or_else(|| AppError::not_found(format!("Task {} in batch {}", task_id, batch_id)))?;
            if task.status.is_terminal() {
                return Err(AppError::validation(format!(
                    "Task {} is already {}",
                    task_id, task.status
                )));
            }
            let was_running = task.status == BatchTaskStatus::Running;
            task.status = BatchTaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            (task.session_id.clone(), was_running)
        };

        info!(batch_id, task_id, "cancelling batch task");
        self.stop_task(batch_id, task_id, session_id.as_deref(), was_running)
            .await;
        self.advance_queue(batch_id).await;
        Ok(())
    }

    /// Claim the terminal outcome, abort the session and drop every mapping
    /// for a task that was just marked cancelled.
    async fn stop_task(&self, batch_id: &str, task_id: &str, session_id: Option<&str>, was_running: bool) {
        self.router.mark_terminal(task_id);
        if let Some(session_id) = session_id {
            if let Err(e) = self.runtime.abort_session(session_id).await {
                warn!(task_id, %session_id, error = %e, "abort call failed");
            }
        }
        self.release_session(task_id, session_id).await;

        self.sink.publish(BoardEvent::BatchTaskCancelled {
            batch_id: batch_id.to_string(),
            task_id: task_id.to_string(),
        });
        if was_running {
            self.log(task_id, LogEntry::info("Batch task cancelled"));
            self.update_record(
                task_id,
                TaskUpdate::status(BoardTaskStatus::Cancelled)
                    .session(None)
                    .paused_at(Some(Utc::now())),
            )
            .await;
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn release_session(&self, task_id: &str, session_id: Option<&str>) {
        if let Some(session_id) = session_id {
            self.sessions.write().await.remove(session_id);
        }
        self.router.release(task_id);
    }

    pub(super) async fn with_batch<R>(
        &self,
        batch_id: &str,
        f: impl FnOnce(&mut Batch) -> R,
    ) -> Option<R> {
        self.batches.write().await.get_mut(batch_id).map(f)
    }

    pub(super) fn log(&self, task_id: &str, entry: LogEntry) {
        self.sink.publish(BoardEvent::ExecutionLog {
            task_id: task_id.to_string(),
            entry,
        });
    }

    pub(super) async fn update_record(&self, task_id: &str, update: TaskUpdate) {
        match self.store.update_task(task_id, update).await {
            Ok(record) => self.sink.publish(BoardEvent::TaskUpdated(record.change())),
            Err(e) => warn!(task_id, error = %e, "failed to update task record"),
        }
    }
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("max_batch_tasks", &self.max_batch_tasks)
            .finish_non_exhaustive()
    }
}

/// Running tasks a batch may have at once.
fn concurrency_limit(batch: &Batch) -> usize {
    match batch.mode {
        BatchMode::Parallel => batch.settings.max_concurrent.max(1),
        BatchMode::Queue => 1,
    }
}

/// Mark the first queued task running and return its id.
fn claim_next(batch: &mut Batch) -> Option<String> {
    let index = batch.next_queued()?;
    let task = &mut batch.tasks[index];
    task.status = BatchTaskStatus::Running;
    task.started_at = Some(Utc::now());
    Some(task.task_id.clone())
}

/// Routes one batch task's session output back to the orchestrator.
struct BatchTaskHandler {
    orchestrator: BatchOrchestrator,
    batch_id: String,
}

#[async_trait]
impl SessionHandler for BatchTaskHandler {
    fn log(&self, task_id: &str, entry: LogEntry) {
        self.orchestrator.log(task_id, entry);
    }

    async fn on_terminal(&self, task_id: &str, outcome: SessionOutcome) {
        self.orchestrator
            .handle_task_complete(&self.batch_id, task_id, outcome)
            .await;
    }
}
