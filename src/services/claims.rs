//! Task Claims
//!
//! A board task runs in at most one place at a time: one live batch or one
//! single-task execution. Both paths share the event router, which is keyed
//! by task id, so they claim their tasks here before any side effect.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::utils::error::{AppError, AppResult};

/// Who currently holds a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOwner {
    Execution,
    Batch(String),
}

impl fmt::Display for ClaimOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution => write!(f, "a single-task execution"),
            Self::Batch(batch_id) => write!(f, "batch {}", batch_id),
        }
    }
}

/// Task id → owner, shared by the controller and the orchestrator
#[derive(Clone, Default)]
pub struct TaskClaims {
    owners: Arc<Mutex<HashMap<String, ClaimOwner>>>,
}

impl TaskClaims {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClaimOwner>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every task for `owner`, or none of them.
    pub fn claim(&self, task_ids: &[String], owner: ClaimOwner) -> AppResult<()> {
        let mut owners = self.lock();
        if let Some((task_id, held_by)) = task_ids
            .iter()
            .find_map(|id| owners.get(id).map(|held_by| (id, held_by)))
        {
            return Err(AppError::TaskClaimed {
                task_id: task_id.clone(),
                owner: held_by.to_string(),
            });
        }
        for task_id in task_ids {
            owners.insert(task_id.clone(), owner.clone());
        }
        debug!(tasks = task_ids.len(), %owner, "tasks claimed");
        Ok(())
    }

    pub fn owner(&self, task_id: &str) -> Option<ClaimOwner> {
        self.lock().get(task_id).cloned()
    }

    /// Release `task_id` if `owner` still holds it.
    pub fn release(&self, task_id: &str, owner: &ClaimOwner) {
        let mut owners = self.lock();
        if owners.get(task_id) == Some(owner) {
            owners.remove(task_id);
        }
    }

    /// Release every task held by the batch.
    pub fn release_batch(&self, batch_id: &str) {
        self.lock()
            .retain(|_, owner| !matches!(owner, ClaimOwner::Batch(id) if *id == batch_id));
    }
}

impl fmt::Debug for TaskClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskClaims")
            .field("claimed", &self.lock().len())
            .finish()
    }
}
