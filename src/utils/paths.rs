//! Cross-Platform Path Utilities
//!
//! Functions for resolving the runner's data directories.

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the Board Runner directory (~/.board-runner/)
pub fn board_runner_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".board-runner"))
}

/// Get the config file path (~/.board-runner/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(board_runner_dir()?.join("config.json"))
}

/// Get the database file path (~/.board-runner/board.db)
pub fn database_path() -> AppResult<PathBuf> {
    Ok(board_runner_dir()?.join("board.db"))
}

/// Default root for repository mirrors and task checkouts.
pub fn default_repos_dir() -> PathBuf {
    std::env::temp_dir().join("board-runner-repos")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get the Board Runner directory, creating if it doesn't exist
pub fn ensure_board_runner_dir() -> AppResult<PathBuf> {
    let path = board_runner_dir()?;
    ensure_dir(&path)?;
    Ok(path)
}
