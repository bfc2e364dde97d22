//! Services
//!
//! Git worktrees, the agent runtime client, event routing and the two
//! execution paths (single task and batch).

pub mod batch;
pub mod broadcast;
pub mod claims;
pub mod execution;
pub mod github;
pub mod runtime;
pub mod worktree;

pub use batch::BatchOrchestrator;
pub use broadcast::{BroadcastHub, ProgressSink};
pub use claims::{ClaimOwner, TaskClaims};
pub use execution::{AgentEventRouter, DeltaBuffer, TaskExecutionController};
pub use github::{GitHubClient, PullRequestHost};
pub use runtime::{AgentRuntime, HttpAgentRuntime};
pub use worktree::{GitOps, WorktreeManager};
