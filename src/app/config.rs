//! Application configuration
//!
//! Command-line level settings that sit above [`EngineConfig`](crate::config::EngineConfig).

use std::path::PathBuf;

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Explicit config file; the per-user default when `None`
    pub config_path: Option<PathBuf>,
    /// Base level when no `-v` is given, from the engine config
    pub base_level: String,
}

impl AppConfig {
    pub fn new(verbose: u8) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn with_base_level(mut self, level: &str) -> Self {
        self.base_level = level.to_string();
        self
    }

    /// Get the log filter string based on verbosity
    pub fn log_level(&self) -> &str {
        match self.verbose {
            0 => &self.base_level,
            1 => "debug",
            _ => "trace",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            config_path: None,
            base_level: "info".to_string(),
        }
    }
}
