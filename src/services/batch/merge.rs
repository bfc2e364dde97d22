//! Merge Stage
//!
//! Once every task of a batch has settled, the completed task branches are
//! merged one by one into the batch branch, which is pushed and offered as a
//! single pull request.

use board_runner_core::{BatchStatus, BatchTaskStatus, BoardEvent, ConflictPolicy, LogEntry};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::orchestrator::BatchOrchestrator;
use crate::models::credential::Credential;
use crate::models::task::{Repository, TaskUpdate};
use crate::services::github::PullRequestRequest;
use crate::utils::text::sanitize_output;

/// Error recorded on a task whose merge conflicted under the fail policy
pub const MERGE_CONFLICT: &str = "Merge conflict";

/// Error recorded on a task left out under the skip policy
pub const MERGE_CONFLICT_SKIPPED: &str = "Merge conflict (skipped)";

struct MergePlan {
    repository: Repository,
    credential: Option<Credential>,
    batch_branch: String,
    policy: ConflictPolicy,
    /// (task id, branch, title) of completed tasks in submission order
    candidates: Vec<(String, String, String)>,
}

impl BatchOrchestrator {
    /// Merge, push and open the batch PR. Expects the batch in `merging`.
    /// Worktrees are cleaned up on every path.
    pub(super) async fn finalize_batch(&self, batch_id: &str) {
        let plan = self
            .with_batch(batch_id, |batch| {
                (batch.status == BatchStatus::Merging).then(|| MergePlan {
                    repository: batch.repository.clone(),
                    credential: batch.credential.clone(),
                    batch_branch: batch.batch_branch.clone(),
                    policy: batch.settings.conflict_behavior,
                    candidates: batch
                        .tasks
                        .iter()
                        .filter(|t| t.status == BatchTaskStatus::Completed)
                        .map(|t| (t.task_id.clone(), t.branch.clone(), t.title.clone()))
                        .collect(),
                })
            })
            .await
            .flatten();
        let Some(plan) = plan else {
            debug!(batch_id, "finalize skipped, batch not merging");
            return;
        };

        info!(batch_id, candidates = plan.candidates.len(), "merging batch");
        self.sink.publish(BoardEvent::BatchMerging {
            batch_id: batch_id.to_string(),
        });

        let repo_id = plan.repository.id.clone();
        self.merge_and_deliver(batch_id, &plan).await;
        self.worktrees.cleanup_batch(&repo_id, batch_id).await;
        self.claims.release_batch(batch_id);
    }

    async fn merge_and_deliver(&self, batch_id: &str, plan: &MergePlan) {
        let repository = &plan.repository;

        if let Err(e) = self
            .worktrees
            .create_batch_branch(&repository.id, &plan.batch_branch, &repository.default_branch)
            .await
        {
            error!(batch_id, error = %e, "failed to create batch branch");
            self.fail_batch(batch_id).await;
            return;
        }

        let mut merged: Vec<(String, String)> = Vec::new();
        for (task_id, branch, title) in &plan.candidates {
            let failure = match self
                .worktrees
                .merge_branch(&repository.id, branch, &plan.batch_branch)
                .await
            {
                Ok(true) => {
                    debug!(batch_id, %task_id, %branch, "task branch merged");
                    merged.push((task_id.clone(), title.clone()));
                    continue;
                }
                Ok(false) => None,
                Err(e) => {
                    warn!(batch_id, %task_id, error = %e, "merge failed");
                    Some(sanitize_output(&e.to_string()))
                }
            };

            match plan.policy {
                ConflictPolicy::Fail => {
                    let message = failure.unwrap_or_else(|| MERGE_CONFLICT.to_string());
                    self.relabel(batch_id, task_id, BatchTaskStatus::Failed, &message)
                        .await;
                    self.sink.publish(BoardEvent::BatchTaskFailed {
                        batch_id: batch_id.to_string(),
                        task_id: task_id.clone(),
                        error: message.clone(),
                    });
                    self.log(task_id, LogEntry::error(format!("Merge failed: {}", message)));
                    // already merged tasks stay on the batch branch
                    self.fail_batch(batch_id).await;
                    return;
                }
                ConflictPolicy::Skip => {
                    let message = failure.unwrap_or_else(|| MERGE_CONFLICT_SKIPPED.to_string());
                    self.relabel(batch_id, task_id, BatchTaskStatus::Skipped, &message)
                        .await;
                    self.sink.publish(BoardEvent::BatchTaskSkipped {
                        batch_id: batch_id.to_string(),
                        task_id: task_id.clone(),
                    });
                    self.log(
                        task_id,
                        LogEntry::info("Skipped from batch pull request").with_details(message),
                    );
                }
            }
        }

        let pr_url = if merged.is_empty() {
            info!(batch_id, "nothing merged, no pull request");
            None
        } else {
            self.push_and_open(batch_id, plan, &merged).await
        };

        let completed = self
            .with_batch(batch_id, |batch| {
                if batch.status != BatchStatus::Merging {
                    return false;
                }
                batch.status = BatchStatus::Completed;
                batch.pr_url = pr_url.clone();
                batch.completed_at = Some(Utc::now());
                true
            })
            .await
            .unwrap_or(false);
        if !completed {
            return;
        }

        if let Some(url) = &pr_url {
            for (task_id, _) in &merged {
                self.update_record(task_id, TaskUpdate::default().pr_url(Some(url.clone())))
                    .await;
            }
        }
        info!(batch_id, ?pr_url, merged = merged.len(), "batch completed");
        self.sink.publish(BoardEvent::BatchCompleted {
            batch_id: batch_id.to_string(),
            pr_url,
        });
    }

    /// Push the batch branch and open its pull request. A failed push leaves
    /// the batch without a PR.
    async fn push_and_open(
        &self,
        batch_id: &str,
        plan: &MergePlan,
        merged: &[(String, String)],
    ) -> Option<String> {
        let repository = &plan.repository;
        if let Err(e) = self
            .worktrees
            .push_branch(
                &repository.id,
                &plan.batch_branch,
                &repository.clone_url,
                plan.credential.as_ref(),
            )
            .await
        {
            error!(batch_id, error = %e, "failed to push batch branch");
            return None;
        }

        let titles: Vec<String> = merged.iter().map(|(_, title)| title.clone()).collect();
        let request = PullRequestRequest::for_batch(
            &repository.full_name,
            &plan.batch_branch,
            &repository.default_branch,
            &titles,
        );
        let result = self
            .prs
            .open_pull_request(&request, plan.credential.as_ref())
            .await;
        info!(batch_id, url = %result.url, compare = result.is_compare_link(), "batch pull request ready");
        Some(result.url)
    }

    async fn relabel(&self, batch_id: &str, task_id: &str, status: BatchTaskStatus, error: &str) {
        self.with_batch(batch_id, |batch| {
            if let Some(task) = batch.task_mut(task_id) {
                task.status = status;
                task.error = Some(error.to_string());
            }
        })
        .await;
    }

    async fn fail_batch(&self, batch_id: &str) {
        self.with_batch(batch_id, |batch| {
            batch.status = BatchStatus::Failed;
            batch.completed_at = Some(Utc::now());
        })
        .await;
        warn!(batch_id, "batch failed");
        self.sink.publish(BoardEvent::BatchFailed {
            batch_id: batch_id.to_string(),
        });
    }
}
