//! Batch Orchestrator Integration Tests
//!
//! Real git against a scratch origin, scripted agent sessions.

use std::sync::atomic::Ordering;

use board_runner::models::settings::ExecutionSettings;
use board_runner::services::batch::{MERGE_CONFLICT, MERGE_CONFLICT_SKIPPED};
use board_runner::storage::Database;
use board_runner::AppError;
use board_runner_core::{BatchMode, BatchStatus, BatchTaskStatus, BoardEvent, BoardTaskStatus, ConflictPolicy};

use crate::support::{git, wait_for_batch, wait_until, Harness};

fn settings(max_batch_size: usize) -> ExecutionSettings {
    ExecutionSettings {
        max_batch_size,
        ..Default::default()
    }
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn status_of(view: &board_runner::models::batch::BatchStatusView, task_id: &str) -> BatchTaskStatus {
    view.task(task_id).expect("task in batch").status
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_create_batch_registers_tasks() {
    let mut h = Harness::new(settings(2), &["t1", "t2"]);

    let view = h
        .batches()
        .create_batch(ids(&["t1", "t2", "t1"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();

    assert_eq!(view.status, BatchStatus::Pending);
    assert_eq!(view.tasks.len(), 2, "duplicate ids collapse");
    assert_eq!(view.tasks[0].branch, "board/t1");
    assert_eq!(view.tasks[0].title, "Task t1");
    assert!(view.batch_branch.starts_with("board/batch-"));
    assert_eq!(view.progress.queued, 2);

    // mirror materialized
    let mirror = h.dir.path().join("repos").join("repo-1").join(".main");
    assert!(mirror.join("HEAD").exists());

    assert_eq!(h.task_record("t1").batch_id.as_deref(), Some(view.id.as_str()));
    let events = h.drain_events();
    assert!(matches!(
        events.first(),
        Some(BoardEvent::BatchCreated { status: BatchStatus::Pending, .. })
    ));

    let active = h.batches().get_active_batches().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].task_count, 2);
}

#[tokio::test]
async fn test_create_batch_unknown_task_gets_placeholder_title() {
    let h = Harness::new(settings(2), &["t1"]);
    let view = h
        .batches()
        .create_batch(ids(&["t1", "ghost"]), BatchMode::Queue, None, None)
        .await
        .unwrap();
    assert_eq!(view.task("ghost").unwrap().title, "Untitled task");
}

#[tokio::test]
async fn test_create_batch_preconditions() {
    let h = Harness::new(settings(2), &["t1"]);

    let err = h
        .batches()
        .create_batch(Vec::new(), BatchMode::Parallel, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let too_many: Vec<String> = (0..50).map(|i| format!("t{}", i)).collect();
    let err = h
        .batches()
        .create_batch(too_many, BatchMode::Parallel, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // another user has no active repository
    let err = h
        .batches()
        .create_batch(ids(&["t1"]), BatchMode::Parallel, Some("user-2"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoActiveRepository));
    assert!(h.batches().get_active_batches().await.is_empty());
}

#[tokio::test]
async fn test_task_in_live_batch_cannot_run_elsewhere() {
    let h = Harness::new(settings(2), &["t1", "t2"]);
    let first = h
        .batches()
        .create_batch(ids(&["t1"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&first.id).await.unwrap();
    h.wait_for_prompt(&first.id, "t1").await;

    let err = h
        .batches()
        .create_batch(ids(&["t2", "t1"]), BatchMode::Parallel, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TaskClaimed { ref task_id, .. } if task_id == "t1"));
    assert_eq!(h.batches().get_active_batches().await.len(), 1);
    assert!(h.task_record("t2").batch_id.is_none());

    let err = h.state.executions().execute_task("t1", None, None).await.unwrap_err();
    assert!(matches!(err, AppError::TaskClaimed { .. }));
    assert_eq!(h.state.executions().running_count(), 0);

    // the first batch is untouched and still delivers
    h.complete_with_change(&first.id, "t1", "one.txt", "one\n").await;
    let view = wait_for_batch(h.batches(), &first.id, |v| v.status.is_terminal()).await;
    assert_eq!(view.status, BatchStatus::Completed);

    // claims are released with the batch; t2 was never held
    let claims = h.state.claims().clone();
    wait_until("claim release", || claims.owner("t1").is_none()).await;
    h.batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_running_execution_blocks_batch_creation() {
    let h = Harness::new(settings(2), &["t1", "t2"]);
    let controller = h.state.executions();
    controller.execute_task("t1", None, None).await.unwrap();

    let err = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Queue, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TaskClaimed { ref task_id, .. } if task_id == "t1"));
    assert!(h.batches().get_active_batches().await.is_empty());

    // t2 was not left claimed by the rejected batch
    h.batches()
        .create_batch(ids(&["t2"]), BatchMode::Queue, None, None)
        .await
        .unwrap();

    controller.cancel_task("t1").await.unwrap();
    h.batches()
        .create_batch(ids(&["t1"]), BatchMode::Queue, None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_store_has_no_active_repository() {
    let db = Database::new_in_memory().unwrap();
    assert!(db.active_repository_for(None).unwrap().is_none());
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_parallel_start_fills_concurrency_slots() {
    let h = Harness::new(settings(2), &["t1", "t2", "t3"]);
    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2", "t3"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();

    h.batches().start_batch(&batch.id).await.unwrap();

    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Running);
    assert_eq!(view.progress.running, 2);
    assert_eq!(view.progress.queued, 1);
    assert_eq!(status_of(&view, "t3"), BatchTaskStatus::Queued);

    // finishing one frees a slot for the third
    h.complete_with_change(&batch.id, "t1", "one.txt", "one\n").await;
    let view = wait_for_batch(h.batches(), &batch.id, |v| {
        v.task("t1").unwrap().status == BatchTaskStatus::Completed
            && v.task("t3").unwrap().status == BatchTaskStatus::Running
    })
    .await;
    assert!(view.progress.running <= 2);
    assert_eq!(view.progress.bucket_sum(), view.progress.total);

    h.batches().cancel_batch(&batch.id).await.unwrap();
}

#[tokio::test]
async fn test_start_batch_twice_is_rejected() {
    let h = Harness::new(settings(1), &["t1"]);
    let batch = h
        .batches()
        .create_batch(ids(&["t1"]), BatchMode::Queue, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();
    assert!(h.batches().start_batch(&batch.id).await.is_err());
    assert!(matches!(
        h.batches().start_batch("missing").await,
        Err(AppError::NotFound(_))
    ));
    h.batches().cancel_batch(&batch.id).await.unwrap();
}

#[tokio::test]
async fn test_queue_mode_waits_for_approval() {
    let h = Harness::new(settings(3), &["t1", "t2"]);
    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Queue, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();

    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Running);
    assert_eq!(status_of(&view, "t2"), BatchTaskStatus::Queued);

    // a second task cannot start while the first runs
    assert!(matches!(
        h.batches().approve_next_task(&batch.id).await,
        Err(AppError::Validation(_))
    ));

    h.complete_with_change(&batch.id, "t1", "one.txt", "one\n").await;
    wait_for_batch(h.batches(), &batch.id, |v| {
        v.task("t1").unwrap().status == BatchTaskStatus::Completed
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(status_of(&view, "t2"), BatchTaskStatus::Queued);
    assert_eq!(view.status, BatchStatus::Running);

    h.batches().approve_next_task(&batch.id).await.unwrap();
    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(status_of(&view, "t2"), BatchTaskStatus::Running);

    assert!(matches!(
        h.batches().approve_next_task(&batch.id).await,
        Err(AppError::NoQueuedTasks)
    ));

    // cancel leaves no session mapping behind
    h.wait_for_prompt(&batch.id, "t2").await;
    h.batches().cancel_batch(&batch.id).await.unwrap();
    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Cancelled);
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Completed);
    assert_eq!(status_of(&view, "t2"), BatchTaskStatus::Cancelled);
    assert_eq!(h.batches().session_count().await, 0);
    let session = view.task("t2").unwrap().session_id.clone().unwrap();
    assert!(h.runtime.was_aborted(&session));
    assert!(h.batches().find_by_session(&session).await.is_none());
    assert_eq!(h.task_record("t2").status, BoardTaskStatus::Cancelled);
}

#[tokio::test]
async fn test_queue_mode_auto_approve_runs_in_order() {
    let h = Harness::new(
        ExecutionSettings {
            queue_auto_approve: true,
            ..settings(3)
        },
        &["t1", "t2"],
    );
    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Queue, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();

    h.complete_with_change(&batch.id, "t1", "one.txt", "one\n").await;
    let view = wait_for_batch(h.batches(), &batch.id, |v| {
        v.task("t2").unwrap().status == BatchTaskStatus::Running
    })
    .await;
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Completed);
    assert_eq!(view.progress.running, 1);

    h.complete_with_change(&batch.id, "t2", "two.txt", "two\n").await;
    let view = wait_for_batch(h.batches(), &batch.id, |v| v.status.is_terminal()).await;
    assert_eq!(view.status, BatchStatus::Completed);
    assert!(view.pr_url.is_some());
}

// ============================================================================
// Failures and cancellation
// ============================================================================

#[tokio::test]
async fn test_session_error_fails_task_and_advances() {
    let h = Harness::new(settings(1), &["t1", "t2"]);
    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();

    let task = h.wait_for_prompt(&batch.id, "t1").await;
    h.runtime.emit(
        task.session_id.as_deref().unwrap(),
        board_runner_core::AgentEventKind::SessionError {
            message: "model overloaded".to_string(),
        },
    );

    let view = wait_for_batch(h.batches(), &batch.id, |v| {
        v.task("t2").unwrap().status == BatchTaskStatus::Running
    })
    .await;
    let failed = view.task("t1").unwrap();
    assert_eq!(failed.status, BatchTaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("model overloaded"));
    assert_eq!(
        h.task_record("t1").outcome.as_deref(),
        Some("Failed: model overloaded")
    );

    h.batches().cancel_batch(&batch.id).await.unwrap();
}

#[tokio::test]
async fn test_prompt_failure_with_stop_on_failure_cancels_batch() {
    let h = Harness::new(
        ExecutionSettings {
            stop_on_failure: true,
            ..settings(1)
        },
        &["t1", "t2"],
    );
    h.runtime.fail_prompts.store(true, Ordering::SeqCst);

    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();

    let view = wait_for_batch(h.batches(), &batch.id, |v| v.status.is_terminal()).await;
    assert_eq!(view.status, BatchStatus::Cancelled);
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Failed);
    assert_eq!(status_of(&view, "t2"), BatchTaskStatus::Cancelled);
    assert_eq!(h.batches().session_count().await, 0);

    // worktrees were cleaned up
    let batch_dir = h
        .dir
        .path()
        .join("repos")
        .join("repo-1")
        .join(format!("batch-{}", batch.id));
    wait_until("batch directory removal", || !batch_dir.exists()).await;
}

#[tokio::test]
async fn test_cancel_single_task_keeps_batch_running() {
    let h = Harness::new(settings(2), &["t1", "t2"]);
    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();
    let task = h.wait_for_prompt(&batch.id, "t1").await;

    h.batches().cancel_task(&batch.id, "t1").await.unwrap();
    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Cancelled);
    assert_eq!(view.status, BatchStatus::Running);
    assert!(h.runtime.was_aborted(task.session_id.as_deref().unwrap()));

    // a late idle for the cancelled session changes nothing
    h.runtime.finish(task.session_id.as_deref().unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Cancelled);

    assert!(h.batches().cancel_task(&batch.id, "t1").await.is_err());

    h.complete_with_change(&batch.id, "t2", "two.txt", "two\n").await;
    let view = wait_for_batch(h.batches(), &batch.id, |v| v.status.is_terminal()).await;
    assert_eq!(view.status, BatchStatus::Completed);
    let requests = h.prs.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].body.contains("- Task t2"));
    assert!(!requests[0].body.contains("- Task t1"));
}

#[tokio::test]
async fn test_cancel_while_task_is_starting_leaves_no_route() {
    let h = Harness::new(settings(1), &["t1"]);
    h.runtime.hold_subscriptions.store(true, Ordering::SeqCst);

    let batch = h
        .batches()
        .create_batch(ids(&["t1"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();
    let runtime = h.runtime.clone();
    wait_until("event subscription", || {
        runtime.subscription_parked.load(Ordering::SeqCst)
    })
    .await;
    let session_id = h
        .batches()
        .get_batch(&batch.id)
        .await
        .unwrap()
        .task("t1")
        .and_then(|t| t.session_id.clone())
        .expect("session registered before attach");

    h.batches().cancel_batch(&batch.id).await.unwrap();
    h.runtime.resume_subscriptions();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let view = h.batches().get_batch(&batch.id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Cancelled);
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Cancelled);
    assert!(h.runtime.was_aborted(&session_id));
    assert!(h.runtime.prompt_for(&session_id).is_none());
    assert!(!h.state.router().is_attached("t1"));
    assert!(!h.state.router().buffer().is_registered("t1"));
    assert_eq!(h.batches().session_count().await, 0);

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Cancelled);
    assert!(record.session_id.is_none());
}

// ============================================================================
// Merge stage
// ============================================================================

async fn run_conflicting_pair(h: &Harness) -> String {
    let batch = h
        .batches()
        .create_batch(ids(&["t1", "t2"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();

    h.complete_with_change(&batch.id, "t1", "README.md", "one\n").await;
    h.complete_with_change(&batch.id, "t2", "README.md", "two\n").await;
    wait_for_batch(h.batches(), &batch.id, |v| v.status.is_terminal()).await;
    batch.id
}

#[tokio::test]
async fn test_conflict_skip_policy_delivers_the_rest() {
    let h = Harness::new(settings(2), &["t1", "t2"]);
    let batch_id = run_conflicting_pair(&h).await;

    let view = h.batches().get_batch(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Completed);
    let skipped = view.task("t2").unwrap();
    assert_eq!(skipped.status, BatchTaskStatus::Skipped);
    assert_eq!(skipped.error.as_deref(), Some(MERGE_CONFLICT_SKIPPED));

    // task 1's change is on the pushed batch branch
    let readme = git(&h.origin, &["show", &format!("{}:README.md", view.batch_branch)]);
    assert_eq!(readme, "one");

    let requests = h.prs.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].title, "Batch: 1 tasks");
    assert!(requests[0].body.contains("- Task t1"));
    assert!(!requests[0].body.contains("Task t2"));
    assert_eq!(requests[0].head, view.batch_branch);
    assert_eq!(requests[0].base, "main");

    let pr_url = view.pr_url.clone().unwrap();
    assert_eq!(h.task_record("t1").pr_url.as_deref(), Some(pr_url.as_str()));
    assert_eq!(h.task_record("t2").pr_url, None);
    assert_eq!(h.task_record("t1").status, BoardTaskStatus::Done);
}

#[tokio::test]
async fn test_conflict_fail_policy_fails_batch() {
    let h = Harness::new(
        ExecutionSettings {
            conflict_behavior: ConflictPolicy::Fail,
            ..settings(2)
        },
        &["t1", "t2"],
    );
    let batch_id = run_conflicting_pair(&h).await;

    let view = h.batches().get_batch(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);
    assert_eq!(status_of(&view, "t1"), BatchTaskStatus::Completed);
    let failed = view.task("t2").unwrap();
    assert_eq!(failed.status, BatchTaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(MERGE_CONFLICT));
    assert!(view.pr_url.is_none());
    assert!(h.prs.requests().is_empty());
}

#[tokio::test]
async fn test_finished_batches_are_pruned() {
    let h = Harness::new(settings(1), &["t1"]);
    let batch = h
        .batches()
        .create_batch(ids(&["t1"]), BatchMode::Parallel, None, None)
        .await
        .unwrap();
    h.batches().start_batch(&batch.id).await.unwrap();
    h.batches().cancel_batch(&batch.id).await.unwrap();
    assert!(h.batches().cancel_batch(&batch.id).await.is_err());

    assert_eq!(h.batches().prune_finished(chrono::Duration::hours(1)).await, 0);
    assert_eq!(h.batches().prune_finished(chrono::Duration::zero()).await, 1);
    assert!(h.batches().get_batch(&batch.id).await.is_none());
}
