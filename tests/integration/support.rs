//! Shared fixtures: a scratch origin repository, an in-memory board store
//! and scripted stand-ins for the agent runtime and the PR host.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};

use board_runner::models::batch::{BatchStatusView, BatchTask};
use board_runner::models::credential::Credential;
use board_runner::models::settings::{ExecutionSettings, RunnerConfig};
use board_runner::models::task::{Repository, TaskRecord};
use board_runner::services::batch::BatchOrchestrator;
use board_runner::services::github::{
    PullRequestHost, PullRequestKind, PullRequestRequest, PullRequestResult,
};
use board_runner::services::runtime::{AgentEventStream, AgentRuntime, ModelRef};
use board_runner::storage::Database;
use board_runner::{AppError, AppResult, RunnerState};
use board_runner_core::{AgentEvent, AgentEventKind, BoardEvent, SessionStatus};

pub const REPO_ID: &str = "repo-1";

// ============================================================================
// Git
// ============================================================================

/// Run git synchronously and return trimmed stdout; panics on failure.
pub fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_AUTHOR_NAME", "Test User")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test User")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A regular repository with one commit on `main`, used as the remote.
pub fn init_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin");
    fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "--quiet"]);
    git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    fs::write(origin.join("README.md"), "# Test Project\n").unwrap();
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "--quiet", "-m", "Initial commit"]);
    origin
}

pub fn repository(origin: &Path) -> Repository {
    Repository {
        id: REPO_ID.to_string(),
        user_id: None,
        name: "app".to_string(),
        full_name: "acme/app".to_string(),
        clone_url: origin.display().to_string(),
        default_branch: "main".to_string(),
        is_active: true,
    }
}

// ============================================================================
// Agent runtime
// ============================================================================

/// Runtime whose sessions never run anything; tests drive them by emitting
/// events.
pub struct MockRuntime {
    next_session: AtomicUsize,
    events: broadcast::Sender<AgentEvent>,
    pub prompts: Mutex<Vec<(String, String)>>,
    pub aborted: Mutex<Vec<String>>,
    pub fail_prompts: AtomicBool,
    /// While set, `subscribe_events` parks until `resume_subscriptions`
    pub hold_subscriptions: AtomicBool,
    pub subscription_parked: AtomicBool,
    resume: Notify,
}

impl MockRuntime {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            next_session: AtomicUsize::new(1),
            events,
            prompts: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            fail_prompts: AtomicBool::new(false),
            hold_subscriptions: AtomicBool::new(false),
            subscription_parked: AtomicBool::new(false),
            resume: Notify::new(),
        }
    }

    pub fn emit(&self, session_id: &str, kind: AgentEventKind) {
        let _ = self.events.send(AgentEvent::new(session_id, kind));
    }

    /// Signal a finished turn: busy (acknowledges the prompt), then idle.
    pub fn finish(&self, session_id: &str) {
        self.emit(session_id, AgentEventKind::SessionStatus(SessionStatus::Busy));
        self.emit(session_id, AgentEventKind::SessionIdle);
    }

    pub fn prompt_for(&self, session_id: &str) -> Option<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .find(|(session, _)| session == session_id)
            .map(|(_, prompt)| prompt.clone())
    }

    pub fn was_aborted(&self, session_id: &str) -> bool {
        self.aborted.lock().unwrap().iter().any(|s| s == session_id)
    }

    pub fn resume_subscriptions(&self) {
        self.hold_subscriptions.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn create_session(&self, _directory: &Path, _title: &str) -> AppResult<String> {
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ses_{}", n))
    }

    async fn send_prompt(&self, session_id: &str, text: &str, _model: Option<&ModelRef>) -> AppResult<()> {
        self.prompts
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        if self.fail_prompts.load(Ordering::SeqCst) {
            return Err(AppError::PromptSendFailed("503: agent unavailable".to_string()));
        }
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> AppResult<()> {
        self.aborted.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn subscribe_events(&self) -> AppResult<AgentEventStream> {
        if self.hold_subscriptions.load(Ordering::SeqCst) {
            self.subscription_parked.store(true, Ordering::SeqCst);
            self.resume.notified().await;
        }
        let rx = self.events.subscribe();
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })))
    }

    async fn current_model(&self) -> AppResult<Option<String>> {
        Ok(None)
    }
}

// ============================================================================
// Pull-request host
// ============================================================================

#[derive(Default)]
pub struct MockPrHost {
    pub requests: Mutex<Vec<PullRequestRequest>>,
}

impl MockPrHost {
    pub fn requests(&self) -> Vec<PullRequestRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PullRequestHost for MockPrHost {
    async fn open_pull_request(
        &self,
        request: &PullRequestRequest,
        _credential: Option<&Credential>,
    ) -> PullRequestResult {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        PullRequestResult {
            url: format!("https://github.com/{}/pull/{}", request.full_name, requests.len()),
            kind: PullRequestKind::PullRequest,
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub origin: PathBuf,
    pub db: Database,
    pub runtime: Arc<MockRuntime>,
    pub prs: Arc<MockPrHost>,
    pub state: RunnerState,
    pub events: broadcast::Receiver<BoardEvent>,
}

impl Harness {
    /// Origin repository, active repository record and one board task per id.
    pub fn new(settings: ExecutionSettings, task_ids: &[&str]) -> Self {
        Self::with_config(settings, task_ids, |_| {})
    }

    pub fn with_config(
        settings: ExecutionSettings,
        task_ids: &[&str],
        configure: impl FnOnce(&mut RunnerConfig),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let origin = init_origin(dir.path());

        let db = Database::new_in_memory().unwrap();
        db.upsert_repository(&repository(&origin)).unwrap();
        db.save_execution_settings(&settings).unwrap();
        for id in task_ids {
            let mut task = TaskRecord::new(*id, format!("Task {}", id));
            task.description = Some(format!("Do the work for {}", id));
            db.save_task(&task).unwrap();
        }

        let mut config = RunnerConfig {
            repos_dir: dir.path().join("repos"),
            delta_flush_ms: 50,
            event_retry_secs: 1,
            ..RunnerConfig::default()
        };
        configure(&mut config);

        let runtime = Arc::new(MockRuntime::new());
        let prs = Arc::new(MockPrHost::default());
        let state = RunnerState::with_services(config, db.clone(), runtime.clone(), prs.clone());
        let events = state.events().subscribe();

        Self {
            dir,
            origin,
            db,
            runtime,
            prs,
            state,
            events,
        }
    }

    pub fn batches(&self) -> &BatchOrchestrator {
        self.state.batches()
    }

    pub fn task_record(&self, id: &str) -> TaskRecord {
        self.db.task(id).unwrap().expect("task exists")
    }

    /// Board events published since the last drain.
    pub fn drain_events(&mut self) -> Vec<BoardEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait until `task_id` has a session whose prompt was sent, and return
    /// the task as seen at that point.
    pub async fn wait_for_prompt(&self, batch_id: &str, task_id: &str) -> BatchTask {
        let runtime = self.runtime.clone();
        let view = wait_for_batch(self.batches(), batch_id, |view| {
            view.task(task_id)
                .and_then(|t| t.session_id.as_deref())
                .is_some_and(|session| runtime.prompt_for(session).is_some())
        })
        .await;
        view.task(task_id).cloned().expect("task in batch")
    }

    /// Let the agent "edit" a file in the task's worktree and finish.
    pub async fn complete_with_change(&self, batch_id: &str, task_id: &str, file: &str, content: &str) {
        let task = self.wait_for_prompt(batch_id, task_id).await;
        let worktree = task.worktree_path.expect("worktree created");
        fs::write(worktree.join(file), content).unwrap();
        self.runtime.finish(task.session_id.as_deref().unwrap());
    }
}

/// Poll `get_batch` until `ready` holds.
pub async fn wait_for_batch<F>(orchestrator: &BatchOrchestrator, batch_id: &str, ready: F) -> BatchStatusView
where
    F: Fn(&BatchStatusView) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let view = orchestrator.get_batch(batch_id).await.expect("batch exists");
        if ready(&view) {
            return view;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on batch {}: {:#?}", batch_id, view.tasks);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll an arbitrary condition.
pub async fn wait_until<F>(what: &str, ready: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !ready() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
