//! Integration Tests Module
//!
//! Worktree plumbing against real git, the batch orchestrator scenarios and
//! the single-task execution path, with the agent runtime and PR host
//! replaced by scripted doubles.

// Shared fixtures and test doubles
mod support;

// Mirror, worktree and merge tests
mod worktree_test;

// Batch orchestration and merge stage tests
mod batch_test;

// Single-task execution tests
mod execution_test;
