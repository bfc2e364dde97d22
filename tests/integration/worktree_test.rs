//! Worktree Integration Tests
//!
//! Mirror, worktree and merge plumbing against a real scratch repository.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use board_runner::services::worktree::{GitIdentity, GitOps, WorktreeManager};

use crate::support::{git, init_origin, REPO_ID};

// ============================================================================
// Helper Functions
// ============================================================================

fn manager(root: &Path) -> WorktreeManager {
    let git = GitOps::with_identity(GitIdentity {
        name: "Board Runner".to_string(),
        email: "runner@example.com".to_string(),
    });
    WorktreeManager::new(root.join("repos"), "board", git)
}

/// Commit one file on the task branch checked out in `worktree`.
async fn commit_file(manager: &WorktreeManager, worktree: &Path, name: &str, content: &str) {
    fs::write(worktree.join(name), content).unwrap();
    assert!(manager.commit_all(worktree, &format!("Add {}", name)).await.unwrap());
}

struct Fixture {
    dir: TempDir,
    manager: WorktreeManager,
    clone_url: String,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let origin = init_origin(dir.path());
    let manager = manager(dir.path());
    let clone_url = origin.display().to_string();
    manager
        .ensure_main_repo(REPO_ID, &clone_url, None)
        .await
        .unwrap();
    Fixture {
        dir,
        manager,
        clone_url,
    }
}

// ============================================================================
// Mirror and worktrees
// ============================================================================

#[tokio::test]
async fn test_ensure_main_repo_is_idempotent() {
    let f = fixture().await;
    let mirror = f.manager.mirror_path(REPO_ID);
    assert!(mirror.join("HEAD").exists());

    // second call refreshes instead of re-cloning
    let again = f
        .manager
        .ensure_main_repo(REPO_ID, &f.clone_url, None)
        .await
        .unwrap();
    assert_eq!(again, mirror);
    assert!(!git(&mirror, &["rev-parse", "refs/remotes/origin/main"]).is_empty());
}

#[tokio::test]
async fn test_concurrent_mirror_refreshes_serialize() {
    let f = fixture().await;
    let (a, b) = tokio::join!(
        f.manager.ensure_main_repo(REPO_ID, &f.clone_url, None),
        f.manager.ensure_main_repo(REPO_ID, &f.clone_url, None),
    );
    assert_eq!(a.unwrap(), b.unwrap());
}

#[tokio::test]
async fn test_create_worktree_on_task_branch() {
    let f = fixture().await;
    let path = f
        .manager
        .create_worktree(REPO_ID, "b1", "t1", "main")
        .await
        .unwrap();

    assert_eq!(path, f.manager.task_worktree_path(REPO_ID, "b1", "t1"));
    assert!(path.join("README.md").exists());
    assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "board/t1");

    // nothing to commit on a fresh worktree
    assert!(!f.manager.commit_all(&path, "noop").await.unwrap());
}

#[tokio::test]
async fn test_create_worktree_with_unknown_base_fails_cleanly() {
    let f = fixture().await;
    let result = f
        .manager
        .create_worktree(REPO_ID, "b1", "t1", "does-not-exist")
        .await;
    assert!(result.is_err());
    assert!(!f.manager.task_worktree_path(REPO_ID, "b1", "t1").exists());
}

#[tokio::test]
async fn test_remove_worktree_tolerates_missing() {
    let f = fixture().await;
    let path = f
        .manager
        .create_worktree(REPO_ID, "b1", "t1", "main")
        .await
        .unwrap();

    f.manager.remove_worktree(REPO_ID, &path).await.unwrap();
    assert!(!path.exists());
    f.manager.remove_worktree(REPO_ID, &path).await.unwrap();
}

#[tokio::test]
async fn test_cleanup_batch_removes_only_that_batch() {
    let f = fixture().await;
    let one = f.manager.create_worktree(REPO_ID, "b1", "t1", "main").await.unwrap();
    let two = f.manager.create_worktree(REPO_ID, "b1", "t2", "main").await.unwrap();
    let other = f.manager.create_worktree(REPO_ID, "b2", "t3", "main").await.unwrap();

    f.manager.cleanup_batch(REPO_ID, "b1").await;

    assert!(!one.exists());
    assert!(!two.exists());
    assert!(!f.manager.batch_dir(REPO_ID, "b1").exists());
    assert!(other.exists());

    let listed = git(&f.manager.mirror_path(REPO_ID), &["worktree", "list", "--porcelain"]);
    assert!(!listed.contains("batch-b1"));
    assert!(listed.contains("batch-b2"));
}

// ============================================================================
// Merging
// ============================================================================

#[tokio::test]
async fn test_merge_branch_is_repeatable() {
    let f = fixture().await;
    let path = f.manager.create_worktree(REPO_ID, "b1", "t1", "main").await.unwrap();
    commit_file(&f.manager, &path, "feature.txt", "feature\n").await;

    f.manager
        .create_batch_branch(REPO_ID, "board/batch-b1", "main")
        .await
        .unwrap();

    assert!(f.manager.merge_branch(REPO_ID, "board/t1", "board/batch-b1").await.unwrap());
    assert!(f.manager.merge_branch(REPO_ID, "board/t1", "board/batch-b1").await.unwrap());

    let mirror = f.manager.mirror_path(REPO_ID);
    let content = git(&mirror, &["show", "board/batch-b1:feature.txt"]);
    assert_eq!(content, "feature");

    // scratch merge worktrees are gone
    let leftovers: Vec<_> = fs::read_dir(f.dir.path().join("repos").join(REPO_ID))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("merge-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_merge_conflict_returns_false_and_keeps_target() {
    let f = fixture().await;
    let one = f.manager.create_worktree(REPO_ID, "b1", "t1", "main").await.unwrap();
    let two = f.manager.create_worktree(REPO_ID, "b1", "t2", "main").await.unwrap();
    commit_file(&f.manager, &one, "README.md", "one\n").await;
    commit_file(&f.manager, &two, "README.md", "two\n").await;

    f.manager
        .create_batch_branch(REPO_ID, "board/batch-b1", "main")
        .await
        .unwrap();
    assert!(f.manager.merge_branch(REPO_ID, "board/t1", "board/batch-b1").await.unwrap());

    let mirror = f.manager.mirror_path(REPO_ID);
    let before = git(&mirror, &["rev-parse", "refs/heads/board/batch-b1"]);
    assert!(!f.manager.merge_branch(REPO_ID, "board/t2", "board/batch-b1").await.unwrap());
    let after = git(&mirror, &["rev-parse", "refs/heads/board/batch-b1"]);
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_merge_unknown_branch_is_an_error() {
    let f = fixture().await;
    f.manager
        .create_batch_branch(REPO_ID, "board/batch-b1", "main")
        .await
        .unwrap();
    assert!(f
        .manager
        .merge_branch(REPO_ID, "board/missing", "board/batch-b1")
        .await
        .is_err());
}

#[tokio::test]
async fn test_push_branch_reaches_origin() {
    let f = fixture().await;
    let path = f.manager.create_worktree(REPO_ID, "b1", "t1", "main").await.unwrap();
    commit_file(&f.manager, &path, "feature.txt", "feature\n").await;
    f.manager
        .create_batch_branch(REPO_ID, "board/batch-b1", "main")
        .await
        .unwrap();
    assert!(f.manager.merge_branch(REPO_ID, "board/t1", "board/batch-b1").await.unwrap());

    f.manager
        .push_branch(REPO_ID, "board/batch-b1", &f.clone_url, None)
        .await
        .unwrap();

    let origin = Path::new(&f.clone_url);
    assert_eq!(git(origin, &["show", "board/batch-b1:feature.txt"]), "feature");
}

// ============================================================================
// Single-task checkouts
// ============================================================================

#[tokio::test]
async fn test_prepare_checkout_clones_then_reuses() {
    let f = fixture().await;
    let checkout = f
        .manager
        .prepare_checkout("app", "task-0001", &f.clone_url, "main", "board/task-0001", None)
        .await
        .unwrap();
    assert_eq!(git(&checkout, &["rev-parse", "--abbrev-ref", "HEAD"]), "board/task-0001");

    // leftovers from a previous run are discarded on reuse
    fs::write(checkout.join("stray.txt"), "x").unwrap();
    let again = f
        .manager
        .prepare_checkout("app", "task-0001", &f.clone_url, "main", "board/task-0001", None)
        .await
        .unwrap();
    assert_eq!(again, checkout);
    assert!(!checkout.join("stray.txt").exists());
}
