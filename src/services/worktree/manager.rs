//! Worktree Manager
//!
//! Owns the on-disk layout under `repos_dir`:
//!
//! ```text
//! <repos_dir>/<repoId>/.main                       bare mirror, one per repository
//! <repos_dir>/<repoId>/batch-<batchId>/task-<id>   batch task worktrees
//! <repos_dir>/<repoId>/merge-<uuid>                disposable merge worktrees
//! <repos_dir>/checkouts/<repo>/<task>              private single-task clones
//! ```
//!
//! Every operation that mutates a mirror runs under that repository's lock,
//! so concurrent callers never fetch, add worktrees or move refs at the same
//! time. No business state lives here.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};
use url::Url;

use crate::models::credential::Credential;
use crate::models::settings::RunnerConfig;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::ensure_dir;

use super::git_ops::{GitIdentity, GitOps, MergeResult};

/// Directory name of the shared bare mirror inside a repository folder
pub const MIRROR_DIR: &str = ".main";

/// Directory holding private single-task clones
pub const CHECKOUTS_DIR: &str = "checkouts";

type RepoLock = Arc<tokio::sync::Mutex<()>>;

/// Manager for mirrors, worktrees and branch plumbing
#[derive(Clone)]
pub struct WorktreeManager {
    /// Git operations wrapper
    git: GitOps,
    repos_dir: PathBuf,
    namespace: String,
    /// One async lock per repository id (or checkout path)
    locks: Arc<Mutex<HashMap<String, RepoLock>>>,
}

impl WorktreeManager {
    pub fn new(repos_dir: impl Into<PathBuf>, namespace: impl Into<String>, git: GitOps) -> Self {
        Self {
            git,
            repos_dir: repos_dir.into(),
            namespace: namespace.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build from the runner config, authoring commits as the configured identity
    pub fn from_config(config: &RunnerConfig) -> Self {
        let git = GitOps::with_identity(GitIdentity {
            name: config.git_author_name.clone(),
            email: config.git_author_email.clone(),
        });
        Self::new(config.repos_dir.clone(), config.branch_namespace.clone(), git)
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn repos_dir(&self) -> &Path {
        &self.repos_dir
    }

    // ── Naming ──────────────────────────────────────────────────────────

    /// `<namespace>/<taskId>`, whether or not the task belongs to a batch
    pub fn branch_for_task(&self, task_id: &str) -> String {
        format!("{}/{}", self.namespace, task_id)
    }

    /// `<namespace>/batch-<first 8 chars of batchId>`
    pub fn batch_branch(&self, batch_id: &str) -> String {
        format!("{}/batch-{}", self.namespace, short_id(batch_id))
    }

    pub fn mirror_path(&self, repo_id: &str) -> PathBuf {
        self.repos_dir.join(repo_id).join(MIRROR_DIR)
    }

    pub fn batch_dir(&self, repo_id: &str, batch_id: &str) -> PathBuf {
        self.repos_dir
            .join(repo_id)
            .join(format!("batch-{}", batch_id))
    }

    pub fn task_worktree_path(&self, repo_id: &str, batch_id: &str, task_id: &str) -> PathBuf {
        self.batch_dir(repo_id, batch_id)
            .join(format!("task-{}", task_id))
    }

    pub fn checkout_path(&self, repo_name: &str, task_id: &str) -> PathBuf {
        self.repos_dir
            .join(CHECKOUTS_DIR)
            .join(repo_name)
            .join(short_id(task_id))
    }

    fn lock_for(&self, key: &str) -> RepoLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── Mirror ──────────────────────────────────────────────────────────

    /// Clone the bare mirror on first use, refresh it afterwards.
    pub async fn ensure_main_repo(
        &self,
        repo_id: &str,
        clone_url: &str,
        credential: Option<&Credential>,
    ) -> AppResult<PathBuf> {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo_id);
        let remote_url = authenticated_url(clone_url, credential);

        if mirror.join("HEAD").exists() {
            debug!(repo_id, "refreshing mirror");
            // token may have rotated since the clone
            self.git
                .set_remote_url(&mirror, "origin", &remote_url)
                .await?;
            self.git.fetch(&mirror, "origin", true).await?;
            return Ok(mirror);
        }

        let parent = self.repos_dir.join(repo_id);
        ensure_dir(&parent)?;
        if mirror.exists() {
            // half-finished clone from an earlier crash
            fs::remove_dir_all(&mirror)?;
        }

        info!(repo_id, path = %mirror.display(), "cloning mirror");
        self.git.clone_bare(&parent, &remote_url, &mirror).await?;
        // bare clones map heads 1:1; track them as origin/* like a normal clone
        self.git
            .set_config(
                &mirror,
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            )
            .await?;
        self.git.fetch(&mirror, "origin", true).await?;
        Ok(mirror)
    }

    // ── Batch worktrees ─────────────────────────────────────────────────

    /// Fetch, then add `task-<id>` on a fresh `<namespace>/<taskId>` branch
    /// off `origin/<base_branch>`.
    pub async fn create_worktree(
        &self,
        repo_id: &str,
        batch_id: &str,
        task_id: &str,
        base_branch: &str,
    ) -> AppResult<PathBuf> {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo_id);
        let path = self.task_worktree_path(repo_id, batch_id, task_id);
        let branch = self.branch_for_task(task_id);

        self.git.fetch(&mirror, "origin", true).await?;
        ensure_dir(&self.batch_dir(repo_id, batch_id))?;

        let base = format!("origin/{}", base_branch);
        match self
            .git
            .add_worktree_on_branch(&mirror, &path, &branch, &base)
            .await
        {
            Ok(()) => {
                info!(repo_id, batch_id, task_id, %branch, "worktree created");
                Ok(path)
            }
            Err(e) => {
                warn!(repo_id, task_id, error = %e, "worktree add failed, cleaning up");
                if self.git.remove_worktree(&mirror, &path, true).await.is_err() {
                    if let Err(rm) = remove_dir_if_present(&path) {
                        warn!(path = %path.display(), error = %rm, "forced removal failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Unregister and delete a worktree; succeeds if it is already gone.
    pub async fn remove_worktree(&self, repo_id: &str, path: &Path) -> AppResult<()> {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;
        self.remove_worktree_locked(repo_id, path).await
    }

    async fn remove_worktree_locked(&self, repo_id: &str, path: &Path) -> AppResult<()> {
        let mirror = self.mirror_path(repo_id);
        if let Err(e) = self.git.remove_worktree(&mirror, path, true).await {
            debug!(repo_id, path = %path.display(), error = %e, "git worktree remove failed");
        }
        remove_dir_if_present(path)?;
        if let Err(e) = self.git.prune_worktrees(&mirror).await {
            debug!(repo_id, error = %e, "worktree prune failed");
        }
        Ok(())
    }

    /// Remove every worktree registered under `batch-<batchId>` plus the
    /// batch directory itself. Failures are logged, never returned.
    pub async fn cleanup_batch(&self, repo_id: &str, batch_id: &str) {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo_id);
        let marker = format!("batch-{}", batch_id);

        match self.git.list_worktrees(&mirror).await {
            Ok(worktrees) => {
                for worktree in worktrees {
                    let path = PathBuf::from(&worktree.path);
                    if path.components().any(|c| c.as_os_str() == marker.as_str()) {
                        if let Err(e) = self.git.remove_worktree(&mirror, &path, true).await {
                            warn!(repo_id, batch_id, path = %path.display(), error = %e, "failed to remove worktree");
                        }
                    }
                }
            }
            Err(e) => warn!(repo_id, batch_id, error = %e, "failed to list worktrees"),
        }

        if let Err(e) = remove_dir_if_present(&self.batch_dir(repo_id, batch_id)) {
            warn!(repo_id, batch_id, error = %e, "failed to remove batch directory");
        }
        if let Err(e) = self.git.prune_worktrees(&mirror).await {
            warn!(repo_id, error = %e, "worktree prune failed");
        }
        info!(repo_id, batch_id, "batch worktrees cleaned up");
    }

    // ── Branches ────────────────────────────────────────────────────────

    /// Point `batch_branch` at `origin/<base_branch>` in the mirror.
    pub async fn create_batch_branch(
        &self,
        repo_id: &str,
        batch_branch: &str,
        base_branch: &str,
    ) -> AppResult<()> {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo_id);
        self.git
            .create_branch(&mirror, batch_branch, &format!("origin/{}", base_branch), true)
            .await
    }

    /// Merge `source` into `target` in a disposable worktree.
    ///
    /// Returns `Ok(false)` on a merge conflict (the merge is aborted), `Ok(true)`
    /// after moving the mirror's `target` ref to the merge result. The
    /// temporary worktree is removed on every path.
    pub async fn merge_branch(&self, repo_id: &str, source: &str, target: &str) -> AppResult<bool> {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo_id);
        let scratch = self
            .repos_dir
            .join(repo_id)
            .join(format!("merge-{}", uuid::Uuid::new_v4()));

        let result = self.merge_in(&mirror, &scratch, source, target).await;

        if let Err(e) = self.remove_worktree_locked(repo_id, &scratch).await {
            warn!(repo_id, path = %scratch.display(), error = %e, "failed to remove merge worktree");
        }
        result
    }

    async fn merge_in(
        &self,
        mirror: &Path,
        scratch: &Path,
        source: &str,
        target: &str,
    ) -> AppResult<bool> {
        let target_ref = format!("refs/heads/{}", target);
        let before = self.git.rev_parse(mirror, &target_ref).await?;
        self.git.add_detached_worktree(mirror, scratch, &before).await?;

        let message = format!("Merge {}", source);
        match self.git.merge(scratch, source, &message).await? {
            MergeResult::Success => {
                let after = self.git.rev_parse(scratch, "HEAD").await?;
                self.git
                    .update_ref(mirror, &target_ref, &after, &before)
                    .await?;
                debug!(%source, %target, "merged");
                Ok(true)
            }
            MergeResult::Conflict(files) => {
                info!(%source, %target, ?files, "merge conflict");
                if let Err(e) = self.git.merge_abort(scratch).await {
                    warn!(error = %e, "merge --abort failed");
                }
                Ok(false)
            }
            MergeResult::Error(e) => {
                let _ = self.git.merge_abort(scratch).await;
                Err(e)
            }
        }
    }

    /// Push a mirror branch to the remote under the same name.
    pub async fn push_branch(
        &self,
        repo_id: &str,
        branch: &str,
        clone_url: &str,
        credential: Option<&Credential>,
    ) -> AppResult<()> {
        let lock = self.lock_for(repo_id);
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo_id);
        let remote = authenticated_url(clone_url, credential);
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.git
            .push(&mirror, &remote, &refspec, false, false)
            .await?;
        info!(repo_id, %branch, "branch pushed");
        Ok(())
    }

    /// Stage and commit everything in `worktree`. Returns `false` when there
    /// was nothing to commit.
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> AppResult<bool> {
        let status = self.git.status(worktree).await?;
        if status.is_clean() {
            return Ok(false);
        }
        self.git.add_all(worktree).await?;
        let sha = self.git.commit(worktree, message).await?;
        debug!(path = %worktree.display(), %sha, changes = status.change_count(), "committed");
        Ok(true)
    }

    // ── Single-task checkouts ───────────────────────────────────────────

    /// Clone-or-reuse a private checkout and reset it onto a fresh `branch`
    /// off `origin/<default_branch>`.
    pub async fn prepare_checkout(
        &self,
        repo_name: &str,
        task_id: &str,
        clone_url: &str,
        default_branch: &str,
        branch: &str,
        credential: Option<&Credential>,
    ) -> AppResult<PathBuf> {
        let path = self.checkout_path(repo_name, task_id);
        let lock = self.lock_for(&path.to_string_lossy());
        let _guard = lock.lock().await;

        let remote_url = authenticated_url(clone_url, credential);

        if path.join(".git").exists() {
            debug!(path = %path.display(), "reusing checkout");
            self.git.set_remote_url(&path, "origin", &remote_url).await?;
            self.git.fetch(&path, "origin", false).await?;
            let start = format!("origin/{}", default_branch);
            self.git
                .checkout_branch(&path, branch, Some(&start), true)
                .await?;
            self.git.clean(&path).await?;
            return Ok(path);
        }

        remove_dir_if_present(&path)?;
        let parent = path
            .parent()
            .ok_or_else(|| AppError::internal("checkout path has no parent"))?;
        ensure_dir(parent)?;

        info!(path = %path.display(), "cloning checkout");
        self.git
            .clone_branch(parent, &remote_url, &path, default_branch)
            .await?;
        self.git.checkout_branch(&path, branch, None, true).await?;
        Ok(path)
    }

    /// Switch an existing local checkout onto `branch` without discarding
    /// local changes.
    pub async fn use_local_checkout(&self, path: &Path, branch: &str) -> AppResult<PathBuf> {
        if !path.exists() {
            return Err(AppError::not_found(format!(
                "Local path does not exist: {}",
                path.display()
            )));
        }
        let lock = self.lock_for(&path.to_string_lossy());
        let _guard = lock.lock().await;
        self.git.checkout_branch(path, branch, None, false).await?;
        Ok(path.to_path_buf())
    }

    /// Force-push an ephemeral task branch to `origin`.
    pub async fn push_task_branch(&self, checkout: &Path, branch: &str) -> AppResult<()> {
        self.git
            .push(checkout, "origin", branch, true, true)
            .await
    }
}

impl std::fmt::Debug for WorktreeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeManager")
            .field("repos_dir", &self.repos_dir)
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Embed `credential` into an http(s) clone URL as `oauth2:<token>`.
/// Other URLs (file paths, ssh) are returned unchanged.
pub fn authenticated_url(clone_url: &str, credential: Option<&Credential>) -> String {
    let Some(credential) = credential else {
        return clone_url.to_string();
    };
    let Ok(mut url) = Url::parse(clone_url) else {
        return clone_url.to_string();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return clone_url.to_string();
    }
    if url.set_username("oauth2").is_err() || url.set_password(Some(credential.expose())).is_err()
    {
        return clone_url.to_string();
    }
    url.to_string()
}
