//! Settings Models
//!
//! Process configuration (`config.json`) and the board-level execution
//! settings read from the durable store.

use std::path::PathBuf;

use board_runner_core::ConflictPolicy;
use serde::{Deserialize, Serialize};

use crate::utils::paths::default_repos_dir;

/// Lower and upper bound for concurrent single-task executions.
pub const PARALLEL_LIMIT_RANGE: (usize, usize) = (1, 5);

/// Runner configuration stored in config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Root directory for repository mirrors, batch worktrees and task checkouts
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
    /// Prefix for every branch the runner creates (`<namespace>/<taskId>`)
    #[serde(default = "default_branch_namespace")]
    pub branch_namespace: String,
    /// Base URL of the coding-agent runtime
    #[serde(default = "default_agent_base_url")]
    pub agent_base_url: String,
    /// Pull-request hosting API
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,
    /// Web host used to build compare links
    #[serde(default = "default_github_web_url")]
    pub github_web_url: String,
    /// Per-execution timeout for the single-task path
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Debounce delay for buffered agent output
    #[serde(default = "default_delta_flush_ms")]
    pub delta_flush_ms: u64,
    /// Backoff before resubscribing to a broken agent event stream
    #[serde(default = "default_event_retry_secs")]
    pub event_retry_secs: u64,
    /// Largest batch accepted by `create_batch`
    #[serde(default = "default_max_batch_tasks")]
    pub max_batch_tasks: usize,
    /// Author/committer name for commits the runner makes
    #[serde(default = "default_git_author_name")]
    pub git_author_name: String,
    /// Author/committer email for commits the runner makes
    #[serde(default = "default_git_author_email")]
    pub git_author_email: String,
}

fn default_branch_namespace() -> String {
    "board".to_string()
}

fn default_agent_base_url() -> String {
    "http://127.0.0.1:4096".to_string()
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_github_web_url() -> String {
    "https://github.com".to_string()
}

fn default_task_timeout_secs() -> u64 {
    30 * 60
}

fn default_delta_flush_ms() -> u64 {
    800
}

fn default_event_retry_secs() -> u64 {
    5
}

fn default_max_batch_tasks() -> usize {
    20
}

fn default_git_author_name() -> String {
    "Board Runner".to_string()
}

fn default_git_author_email() -> String {
    "board-runner@localhost".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
            branch_namespace: default_branch_namespace(),
            agent_base_url: default_agent_base_url(),
            github_api_url: default_github_api_url(),
            github_web_url: default_github_web_url(),
            task_timeout_secs: default_task_timeout_secs(),
            delta_flush_ms: default_delta_flush_ms(),
            event_retry_secs: default_event_retry_secs(),
            max_batch_tasks: default_max_batch_tasks(),
            git_author_name: default_git_author_name(),
            git_author_email: default_git_author_email(),
        }
    }
}

/// Config update request (partial update)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunnerConfigUpdate {
    pub repos_dir: Option<PathBuf>,
    pub branch_namespace: Option<String>,
    pub agent_base_url: Option<String>,
    pub github_api_url: Option<String>,
    pub github_web_url: Option<String>,
    pub task_timeout_secs: Option<u64>,
    pub delta_flush_ms: Option<u64>,
    pub event_retry_secs: Option<u64>,
    pub max_batch_tasks: Option<usize>,
    pub git_author_name: Option<String>,
    pub git_author_email: Option<String>,
}

impl RunnerConfig {
    /// Apply a partial update to the configuration
    pub fn apply_update(&mut self, update: RunnerConfigUpdate) {
        if let Some(dir) = update.repos_dir {
            self.repos_dir = dir;
        }
        if let Some(namespace) = update.branch_namespace {
            self.branch_namespace = namespace;
        }
        if let Some(url) = update.agent_base_url {
            self.agent_base_url = url;
        }
        if let Some(url) = update.github_api_url {
            self.github_api_url = url;
        }
        if let Some(url) = update.github_web_url {
            self.github_web_url = url;
        }
        if let Some(secs) = update.task_timeout_secs {
            self.task_timeout_secs = secs;
        }
        if let Some(ms) = update.delta_flush_ms {
            self.delta_flush_ms = ms;
        }
        if let Some(secs) = update.event_retry_secs {
            self.event_retry_secs = secs;
        }
        if let Some(max) = update.max_batch_tasks {
            self.max_batch_tasks = max;
        }
        if let Some(name) = update.git_author_name {
            self.git_author_name = name;
        }
        if let Some(email) = update.git_author_email {
            self.git_author_email = email;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let ns = &self.branch_namespace;
        if ns.is_empty()
            || ns.starts_with('/')
            || ns.ends_with('/')
            || ns.contains("..")
            || !ns
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
        {
            return Err(format!("Invalid branch namespace: {}", ns));
        }

        for (name, value) in [
            ("agent_base_url", &self.agent_base_url),
            ("github_api_url", &self.github_api_url),
            ("github_web_url", &self.github_web_url),
        ] {
            url::Url::parse(value).map_err(|e| format!("Invalid {}: {} ({})", name, value, e))?;
        }

        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be greater than 0".to_string());
        }
        if self.delta_flush_ms == 0 {
            return Err("delta_flush_ms must be greater than 0".to_string());
        }
        if self.max_batch_tasks == 0 || self.max_batch_tasks > 100 {
            return Err("max_batch_tasks must be between 1 and 100".to_string());
        }
        if self.git_author_name.trim().is_empty() || !self.git_author_email.contains('@') {
            return Err("git author name and email must be set".to_string());
        }

        Ok(())
    }
}

/// Board-level execution settings, read from the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    /// Ceiling on concurrent single-task executions (1 to 5)
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    /// Concurrency for `parallel` batches
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Start the next queued task automatically in `queue` batches
    #[serde(default)]
    pub queue_auto_approve: bool,
    /// Escalate any task failure into a whole-batch cancel
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub conflict_behavior: ConflictPolicy,
}

fn default_parallel_limit() -> usize {
    3
}

fn default_max_batch_size() -> usize {
    3
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            parallel_limit: default_parallel_limit(),
            max_batch_size: default_max_batch_size(),
            queue_auto_approve: false,
            stop_on_failure: false,
            conflict_behavior: ConflictPolicy::Skip,
        }
    }
}

impl ExecutionSettings {
    /// Clamp stored values into their allowed ranges.
    pub fn normalized(mut self) -> Self {
        let (min, max) = PARALLEL_LIMIT_RANGE;
        self.parallel_limit = self.parallel_limit.clamp(min, max);
        self.max_batch_size = self.max_batch_size.max(1);
        self
    }
}
