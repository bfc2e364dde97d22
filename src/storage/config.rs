//! JSON Configuration Management
//!
//! Handles reading and writing the runner configuration file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::models::settings::{RunnerConfig, RunnerConfigUpdate};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{config_path, ensure_board_runner_dir};

/// Configuration service for managing runner settings
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: RunnerConfig,
}

impl ConfigService {
    /// Load `~/.board-runner/config.json`, creating it with defaults if missing
    pub fn new() -> AppResult<Self> {
        ensure_board_runner_dir()?;
        Self::open(config_path()?)
    }

    /// Load (or create) a config file at an explicit path
    pub fn open(config_path: PathBuf) -> AppResult<Self> {
        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            let default_config = RunnerConfig::default();
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            Self::save_to_file(&config_path, &default_config)?;
            info!(path = %config_path.display(), "wrote default runner config");
            default_config
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> AppResult<RunnerConfig> {
        let content = fs::read_to_string(path)?;
        let config: RunnerConfig = serde_json::from_str(&content)?;
        config.validate().map_err(AppError::config)?;
        Ok(config)
    }

    /// Save configuration to a file with pretty formatting
    fn save_to_file(path: &Path, config: &RunnerConfig) -> AppResult<()> {
        config.validate().map_err(AppError::config)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the current configuration
    pub fn get_config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Update the configuration with a partial update.
    ///
    /// An invalid result is rejected and the previous configuration kept.
    pub fn update_config(&mut self, update: RunnerConfigUpdate) -> AppResult<RunnerConfig> {
        let mut candidate = self.config.clone();
        candidate.apply_update(update);
        Self::save_to_file(&self.config_path, &candidate)?;
        self.config = candidate;
        Ok(self.config.clone())
    }

    /// Reload configuration from disk
    pub fn reload(&mut self) -> AppResult<()> {
        self.config = Self::load_from_file(&self.config_path)?;
        Ok(())
    }
}
