//! Git Operations
//!
//! Async wrapper around the git CLI for mirrors, worktrees, commits, merges
//! and pushes. Every non-zero exit surfaces as `AppError::GitOperationFailed`
//! with redacted, truncated output; interpreting the failure is the caller's
//! job.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::utils::error::{AppError, AppResult};
use crate::utils::text::{redact_credentials, sanitize_output};

/// Name/email stamped on commits and merges the runner creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// Result of a git command execution
#[derive(Debug)]
pub struct GitResult {
    pub command: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitResult {
    /// Check if the command was successful and return stdout or error
    pub fn into_result(self) -> AppResult<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(self.into_error())
        }
    }

    /// Convert a failed result into `GitOperationFailed`.
    pub fn into_error(self) -> AppError {
        let output = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        AppError::git(
            self.command,
            format!("(exit {}) {}", self.exit_code, sanitize_output(output)),
        )
    }
}

/// Git operations wrapper
#[derive(Debug, Clone, Default)]
pub struct GitOps {
    identity: Option<GitIdentity>,
}

impl GitOps {
    /// Create a new GitOps instance
    pub fn new() -> Self {
        Self { identity: None }
    }

    /// Commits and merges are authored as `identity`
    pub fn with_identity(identity: GitIdentity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    /// Execute a git command in the specified directory
    pub async fn execute(&self, cwd: &Path, args: &[&str]) -> AppResult<GitResult> {
        let command = redact_credentials(&format!("git {}", args.join(" ")));
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            // Disable interactive prompts to avoid hanging automation flows/tests.
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(identity) = &self.identity {
            cmd.env("GIT_AUTHOR_NAME", &identity.name)
                .env("GIT_AUTHOR_EMAIL", &identity.email)
                .env("GIT_COMMITTER_NAME", &identity.name)
                .env("GIT_COMMITTER_EMAIL", &identity.email);
        }

        debug!(cwd = %cwd.display(), %command, "running git");
        let output = cmd.output().await.map_err(|e| {
            AppError::git(command.clone(), format!("failed to execute git: {}", e))
        })?;

        Ok(GitResult {
            command,
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> AppResult<String> {
        self.execute(cwd, args).await?.into_result()
    }

    /// `git clone --bare <url> <dest>`
    pub async fn clone_bare(&self, cwd: &Path, url: &str, dest: &Path) -> AppResult<()> {
        let dest = dest.to_string_lossy();
        self.run(cwd, &["clone", "--bare", url, &dest]).await?;
        Ok(())
    }

    /// Shallow single-branch clone used for private task checkouts
    pub async fn clone_branch(
        &self,
        cwd: &Path,
        url: &str,
        dest: &Path,
        branch: &str,
    ) -> AppResult<()> {
        let dest = dest.to_string_lossy();
        self.run(
            cwd,
            &["clone", "--depth", "1", "--branch", branch, url, &dest],
        )
        .await?;
        Ok(())
    }

    /// Set a repository-local config value
    pub async fn set_config(&self, cwd: &Path, key: &str, value: &str) -> AppResult<()> {
        self.run(cwd, &["config", key, value]).await?;
        Ok(())
    }

    /// Point a remote at a new URL
    pub async fn set_remote_url(&self, cwd: &Path, remote: &str, url: &str) -> AppResult<()> {
        self.run(cwd, &["remote", "set-url", remote, url]).await?;
        Ok(())
    }

    /// Fetch from a remote, optionally pruning deleted refs
    pub async fn fetch(&self, cwd: &Path, remote: &str, prune: bool) -> AppResult<()> {
        let mut args = vec!["fetch", remote];
        if prune {
            args.push("--prune");
        }
        self.run(cwd, &args).await?;
        Ok(())
    }

    /// Resolve a revision to a commit sha
    pub async fn rev_parse(&self, cwd: &Path, rev: &str) -> AppResult<String> {
        self.run(cwd, &["rev-parse", "--verify", rev])
            .await
            .map(|s| s.trim().to_string())
    }

    /// Create (or with `force`, reset) a branch at `base`
    pub async fn create_branch(
        &self,
        cwd: &Path,
        branch: &str,
        base: &str,
        force: bool,
    ) -> AppResult<()> {
        let mut args = vec!["branch"];
        if force {
            args.push("-f");
        }
        args.extend([branch, base]);
        self.run(cwd, &args).await?;
        Ok(())
    }

    /// `git checkout [--force] -B <branch> [start]`
    pub async fn checkout_branch(
        &self,
        cwd: &Path,
        branch: &str,
        start: Option<&str>,
        force: bool,
    ) -> AppResult<()> {
        let mut args = vec!["checkout"];
        if force {
            args.push("--force");
        }
        args.extend(["-B", branch]);
        if let Some(start) = start {
            args.push(start);
        }
        self.run(cwd, &args).await?;
        Ok(())
    }

    /// Remove untracked files and directories
    pub async fn clean(&self, cwd: &Path) -> AppResult<()> {
        self.run(cwd, &["clean", "-fd"]).await?;
        Ok(())
    }

    /// Add a worktree on `branch`, creating or resetting it at `base`
    pub async fn add_worktree_on_branch(
        &self,
        cwd: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> AppResult<()> {
        let path_str = path.to_string_lossy();
        self.run(cwd, &["worktree", "add", "-B", branch, &path_str, base])
            .await?;
        Ok(())
    }

    /// Add a worktree with a detached HEAD at `commitish`
    pub async fn add_detached_worktree(
        &self,
        cwd: &Path,
        path: &Path,
        commitish: &str,
    ) -> AppResult<()> {
        let path_str = path.to_string_lossy();
        self.run(cwd, &["worktree", "add", "--detach", &path_str, commitish])
            .await?;
        Ok(())
    }

    /// Remove a worktree
    pub async fn remove_worktree(&self, cwd: &Path, path: &Path, force: bool) -> AppResult<()> {
        let path_str = path.to_string_lossy();
        let args = if force {
            vec!["worktree", "remove", "--force", &path_str]
        } else {
            vec!["worktree", "remove", &path_str]
        };
        self.run(cwd, &args).await?;
        Ok(())
    }

    /// Prune stale worktrees
    pub async fn prune_worktrees(&self, cwd: &Path) -> AppResult<()> {
        self.run(cwd, &["worktree", "prune"]).await?;
        Ok(())
    }

    /// List all worktrees
    pub async fn list_worktrees(&self, cwd: &Path) -> AppResult<Vec<WorktreeInfo>> {
        let output = self
            .run(cwd, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output))
    }

    /// Stage all changes
    pub async fn add_all(&self, cwd: &Path) -> AppResult<()> {
        self.run(cwd, &["add", "-A"]).await?;
        Ok(())
    }

    /// Commit staged changes and return the new sha
    pub async fn commit(&self, cwd: &Path, message: &str) -> AppResult<String> {
        self.run(cwd, &["commit", "-m", message]).await?;
        self.rev_parse(cwd, "HEAD").await
    }

    /// Merge a branch into the current HEAD with a merge commit
    pub async fn merge(&self, cwd: &Path, branch: &str, message: &str) -> AppResult<MergeResult> {
        let result = self
            .execute(cwd, &["merge", "--no-ff", "-m", message, branch])
            .await?;

        if result.success {
            Ok(MergeResult::Success)
        } else if result.stdout.contains("CONFLICT") || result.stderr.contains("CONFLICT") {
            let conflicts = self.conflicting_files(cwd).await.unwrap_or_default();
            Ok(MergeResult::Conflict(conflicts))
        } else {
            Ok(MergeResult::Error(result.into_error()))
        }
    }

    /// Abort a merge in progress
    pub async fn merge_abort(&self, cwd: &Path) -> AppResult<()> {
        self.run(cwd, &["merge", "--abort"]).await?;
        Ok(())
    }

    /// Get list of conflicting files
    pub async fn conflicting_files(&self, cwd: &Path) -> AppResult<Vec<String>> {
        let output = self
            .run(cwd, &["diff", "--name-only", "--diff-filter=U"])
            .await?;

        Ok(output
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Move `refname` to `new_sha`, guarded by its expected current value
    pub async fn update_ref(
        &self,
        cwd: &Path,
        refname: &str,
        new_sha: &str,
        old_sha: &str,
    ) -> AppResult<()> {
        self.run(cwd, &["update-ref", refname, new_sha, old_sha])
            .await?;
        Ok(())
    }

    /// Push `refspec` to a remote name or URL
    pub async fn push(
        &self,
        cwd: &Path,
        remote: &str,
        refspec: &str,
        force: bool,
        set_upstream: bool,
    ) -> AppResult<()> {
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        if set_upstream {
            args.push("-u");
        }
        args.extend([remote, refspec]);
        self.run(cwd, &args).await?;
        Ok(())
    }

    /// Get status of the working directory
    pub async fn status(&self, cwd: &Path) -> AppResult<GitStatus> {
        let output = self.run(cwd, &["status", "--porcelain"]).await?;
        Ok(parse_status(&output))
    }
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current = WorktreeInfo::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.is_empty() {
                worktrees.push(std::mem::take(&mut current));
            }
            current.path = path.to_string();
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            current.branch = branch
                .strip_prefix("refs/heads/")
                .unwrap_or(branch)
                .to_string();
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        } else if line.starts_with("prunable") {
            current.is_prunable = true;
        }
    }

    if !current.path.is_empty() {
        worktrees.push(current);
    }
    worktrees
}

fn parse_status(output: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in output.lines() {
        if line.len() < 3 {
            continue;
        }

        let mut codes = line.chars();
        let index_status = codes.next().unwrap_or(' ');
        let work_status = codes.next().unwrap_or(' ');
        let file = line[3..].to_string();

        match (index_status, work_status) {
            ('?', '?') => status.untracked.push(file),
            ('U', _) | (_, 'U') | ('A', 'A') | ('D', 'D') => status.conflicted.push(file),
            ('D', _) | (_, 'D') => status.deleted.push(file),
            ('R', _) => status.renamed.push(file),
            ('A', _) => status.staged.push(file),
            ('M', _) | (_, 'M') => {
                if index_status != ' ' {
                    status.staged.push(file.clone());
                }
                if work_status != ' ' {
                    status.modified.push(file);
                }
            }
            _ => {}
        }
    }

    status
}

/// Information about a git worktree
#[derive(Debug, Default, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub head: String,
    pub branch: String,
    pub is_bare: bool,
    pub is_detached: bool,
    pub is_prunable: bool,
}

/// Result of a merge operation
#[derive(Debug)]
pub enum MergeResult {
    Success,
    Conflict(Vec<String>),
    Error(AppError),
}

/// Git working directory status
#[derive(Debug, Default)]
pub struct GitStatus {
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl GitStatus {
    /// Check if the working directory is clean
    pub fn is_clean(&self) -> bool {
        self.change_count() == 0
    }

    /// Get total number of changes
    pub fn change_count(&self) -> usize {
        self.staged.len()
            + self.modified.len()
            + self.deleted.len()
            + self.renamed.len()
            + self.untracked.len()
            + self.conflicted.len()
    }
}
