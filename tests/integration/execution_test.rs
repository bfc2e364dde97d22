//! Single-Task Execution Integration Tests

use std::fs;
use std::sync::atomic::Ordering;
use std::time::Duration;

use board_runner::models::settings::ExecutionSettings;
use board_runner::AppError;
use board_runner_core::{AgentEventKind, BoardTaskStatus};

use crate::support::{git, wait_until, Harness};

fn settings(parallel_limit: usize) -> ExecutionSettings {
    ExecutionSettings {
        parallel_limit,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_single_task_delivers_pull_request() {
    let h = Harness::new(settings(3), &["t1"]);
    let controller = h.state.executions();

    controller.execute_task("t1", None, None).await.unwrap();
    assert!(controller.is_running("t1"));
    let runtime = h.runtime.clone();
    wait_until("prompt", || runtime.prompt_for("ses_1").is_some()).await;
    assert_eq!(
        h.runtime.prompt_for("ses_1").unwrap(),
        "Task t1\n\nDo the work for t1"
    );

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::InProgress);
    assert_eq!(record.session_id.as_deref(), Some("ses_1"));

    let snapshot = controller.execution_status("t1").unwrap();
    assert_eq!(snapshot.branch, "board/t1");
    let checkout = snapshot.repo_path.unwrap();
    fs::write(checkout.join("feature.txt"), "feature\n").unwrap();
    h.runtime.emit(
        "ses_1",
        AgentEventKind::FileEdited {
            file: "feature.txt".to_string(),
        },
    );
    h.runtime.finish("ses_1");

    wait_until("execution end", || !controller.is_running("t1")).await;

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Done);
    assert_eq!(record.execution_progress, Some(100));
    assert_eq!(
        record.pr_url.as_deref(),
        Some("https://github.com/acme/app/pull/1")
    );
    assert_eq!(record.outcome.as_deref(), Some("1 file changed, 0 tools executed"));
    assert!(record
        .execution_logs
        .iter()
        .any(|entry| entry.message == "Agent completed work"));

    assert_eq!(git(&h.origin, &["show", "board/t1:feature.txt"]), "feature");
    let requests = h.prs.requests();
    assert_eq!(requests[0].head, "board/t1");
    assert_eq!(requests[0].body, "Do the work for t1");
}

#[tokio::test]
async fn test_completion_without_changes() {
    let h = Harness::new(settings(3), &["t1"]);
    let controller = h.state.executions();

    controller.execute_task("t1", None, None).await.unwrap();
    let runtime = h.runtime.clone();
    wait_until("prompt", || runtime.prompt_for("ses_1").is_some()).await;
    h.runtime.finish("ses_1");
    wait_until("execution end", || !controller.is_running("t1")).await;

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Done);
    assert_eq!(record.outcome.as_deref(), Some("Completed with no changes"));
    assert!(record.pr_url.is_none());
    assert!(h.prs.requests().is_empty());
}

#[tokio::test]
async fn test_execution_preconditions() {
    let h = Harness::new(settings(1), &["t1", "t2"]);
    let controller = h.state.executions();

    assert!(matches!(
        controller.execute_task("missing", None, None).await,
        Err(AppError::NotFound(_))
    ));

    controller.execute_task("t1", None, None).await.unwrap();
    assert!(matches!(
        controller.execute_task("t1", None, None).await,
        Err(AppError::AlreadyRunning(_))
    ));
    assert!(matches!(
        controller.execute_task("t2", None, None).await,
        Err(AppError::ParallelLimitReached(1))
    ));
    assert_eq!(controller.running_count(), 1);

    controller.cancel_task("t1").await.unwrap();
    assert!(!controller.is_running("t1"));
    assert!(matches!(
        controller.cancel_task("t1").await,
        Err(AppError::NotRunning(_))
    ));

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Cancelled);
    assert!(record.execution_paused_at.is_some());
    assert!(h.runtime.was_aborted("ses_1"));
    assert!(record
        .execution_logs
        .iter()
        .any(|entry| entry.message == "Execution cancelled by user"));

    // the slot is free again
    controller.execute_task("t2", None, None).await.unwrap();
    controller.cancel_task("t2").await.unwrap();
}

#[tokio::test]
async fn test_session_error_cancels_task_record() {
    let h = Harness::new(settings(3), &["t1"]);
    let controller = h.state.executions();

    controller.execute_task("t1", None, None).await.unwrap();
    let runtime = h.runtime.clone();
    wait_until("prompt", || runtime.prompt_for("ses_1").is_some()).await;
    h.runtime.emit(
        "ses_1",
        AgentEventKind::SessionError {
            message: "boom".to_string(),
        },
    );
    wait_until("execution end", || !controller.is_running("t1")).await;

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Cancelled);
    assert_eq!(record.outcome.as_deref(), Some("Failed: boom"));
    assert!(controller.find_task_by_session("ses_1").is_none());
}

#[tokio::test]
async fn test_streamed_text_is_logged_once() {
    let mut h = Harness::new(settings(3), &["t1"]);
    let controller = h.state.executions();

    controller.execute_task("t1", None, None).await.unwrap();
    let runtime = h.runtime.clone();
    wait_until("prompt", || runtime.prompt_for("ses_1").is_some()).await;
    for delta in ["The pl", "an is rea", "dy."] {
        h.runtime
            .emit("ses_1", AgentEventKind::TextDelta(delta.to_string()));
    }
    h.runtime.finish("ses_1");
    wait_until("execution end", || !controller.is_running("t1")).await;

    let lines: Vec<String> = h
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            board_runner_core::BoardEvent::ExecutionLog { entry, .. } => Some(entry.message),
            _ => None,
        })
        .filter(|message| message.contains("plan") || message.contains("dy."))
        .collect();
    assert_eq!(lines, vec!["The plan is ready.".to_string()]);
}

#[tokio::test]
async fn test_cancel_while_starting_leaves_no_route() {
    let h = Harness::new(settings(3), &["t1"]);
    h.runtime.hold_subscriptions.store(true, Ordering::SeqCst);

    let controller = h.state.executions().clone();
    let starting = tokio::spawn(async move { controller.execute_task("t1", None, None).await });
    let runtime = h.runtime.clone();
    wait_until("event subscription", || {
        runtime.subscription_parked.load(Ordering::SeqCst)
    })
    .await;

    let controller = h.state.executions();
    assert_eq!(
        controller.execution_status("t1").unwrap().session_id.as_deref(),
        Some("ses_1")
    );
    controller.cancel_task("t1").await.unwrap();
    h.runtime.resume_subscriptions();
    starting.await.unwrap().unwrap();

    assert!(!controller.is_running("t1"));
    assert!(h.runtime.was_aborted("ses_1"));
    assert!(h.runtime.prompt_for("ses_1").is_none());
    assert!(!h.state.router().is_attached("t1"));
    assert!(!h.state.router().buffer().is_registered("t1"));

    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Cancelled);
    assert!(record.session_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_execution() {
    let h = Harness::with_config(settings(3), &["t1"], |config| {
        config.task_timeout_secs = 120;
    });
    let controller = h.state.executions();

    controller.execute_task("t1", None, None).await.unwrap();
    let runtime = h.runtime.clone();
    wait_until("prompt", || runtime.prompt_for("ses_1").is_some()).await;
    assert!(controller.is_running("t1"));

    tokio::time::sleep(Duration::from_secs(121)).await;
    wait_until("timeout cancel", || !controller.is_running("t1")).await;

    assert!(h.runtime.was_aborted("ses_1"));
    assert!(!h.state.router().is_attached("t1"));
    let record = h.task_record("t1");
    assert_eq!(record.status, BoardTaskStatus::Cancelled);
    assert!(record.execution_paused_at.is_some());
    assert!(record
        .execution_logs
        .iter()
        .any(|entry| entry.message == "Execution timed out after 2 minutes"));
}
