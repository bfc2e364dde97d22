//! Worktree Service
//!
//! Shared bare mirrors, per-task worktrees, merges and pushes.

mod git_ops;
mod manager;

pub use git_ops::*;
pub use manager::*;
