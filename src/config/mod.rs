//! Engine configuration
//!
//! Every knob the engine consumes (lock lease, subprocess timeouts, retry
//! budget) comes from here rather than being hardcoded. Values are read from
//! a YAML file, then `DATAGEST_*` environment variables override individual
//! fields, then the result is validated.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error::{Classified, ErrorKind};
use crate::retry::RetryPolicy;
use crate::workflow::EngineSettings;

pub mod loader;

pub use loader::ConfigLoader;

/// Prefix for environment overrides, e.g. `DATAGEST_LOCK_TTL=2h`
pub const ENV_PREFIX: &str = "DATAGEST_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value '{value}' for {var}: {reason}")]
    EnvOverride {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Classified for ConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => ErrorKind::Io,
            _ => ErrorKind::InvalidRequest,
        }
    }
}

/// Per-user data directory, used for defaults when no path is configured
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "datagest", "datagest")
}

/// Default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.yaml"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local clone the workflows operate on
    pub workspace_root: PathBuf,
    /// Shared directory holding the advisory lock files
    pub locks_root: PathBuf,
    pub remote: String,
    pub branch: String,
    /// Named large-file remote; the backend default when unset
    pub dvc_remote: Option<String>,
    pub git_executable: String,
    pub dvc_executable: String,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub git_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dvc_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long shutdown waits for active runs after cancelling them
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub log_level: String,
    /// Allows force-unlocking locks held by other clients
    pub admin_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".datagest"));

        Self {
            workspace_root: data_dir.join("workspace"),
            locks_root: data_dir.join("locks"),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            dvc_remote: None,
            git_executable: "git".to_string(),
            dvc_executable: "dvc".to_string(),
            lock_ttl: Duration::from_secs(4 * 3600),
            git_timeout: Duration::from_secs(300),
            dvc_timeout: Duration::from_secs(1800),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            log_level: "info".to_string(),
            admin_mode: false,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Apply `DATAGEST_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a full variable name to its value
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let var = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&var).map(|value| (var, value))
        };

        if let Some((_, value)) = get("WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(value);
        }
        if let Some((_, value)) = get("LOCKS_ROOT") {
            self.locks_root = PathBuf::from(value);
        }
        if let Some((_, value)) = get("REMOTE") {
            self.remote = value;
        }
        if let Some((_, value)) = get("BRANCH") {
            self.branch = value;
        }
        if let Some((_, value)) = get("DVC_REMOTE") {
            self.dvc_remote = Some(value).filter(|v| !v.is_empty());
        }
        if let Some((_, value)) = get("GIT_EXECUTABLE") {
            self.git_executable = value;
        }
        if let Some((_, value)) = get("DVC_EXECUTABLE") {
            self.dvc_executable = value;
        }
        if let Some((var, value)) = get("LOCK_TTL") {
            self.lock_ttl = parse_duration(&var, &value)?;
        }
        if let Some((var, value)) = get("GIT_TIMEOUT") {
            self.git_timeout = parse_duration(&var, &value)?;
        }
        if let Some((var, value)) = get("DVC_TIMEOUT") {
            self.dvc_timeout = parse_duration(&var, &value)?;
        }
        if let Some((var, value)) = get("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = value.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::EnvOverride {
                    var,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some((var, value)) = get("RETRY_BASE_DELAY") {
            self.retry.base_delay = parse_duration(&var, &value)?;
        }
        if let Some((var, value)) = get("RETRY_MAX_DELAY") {
            self.retry.max_delay = parse_duration(&var, &value)?;
        }
        if let Some((var, value)) = get("SHUTDOWN_GRACE") {
            self.shutdown_grace = parse_duration(&var, &value)?;
        }
        if let Some((_, value)) = get("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some((var, value)) = get("ADMIN_MODE") {
            self.admin_mode = value.parse().map_err(|e: std::str::ParseBoolError| {
                ConfigError::EnvOverride {
                    var,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("lock_ttl", self.lock_ttl),
            ("git_timeout", self.git_timeout),
            ("dvc_timeout", self.dvc_timeout),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid(
                "retry.max_delay must not be shorter than retry.base_delay".to_string(),
            ));
        }
        if self.remote.trim().is_empty() || self.branch.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "remote and branch must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings the workflow engine runs with
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            remote: self.remote.clone(),
            branch: self.branch.clone(),
            lock_ttl: self.lock_ttl,
            retry: self.retry.clone(),
        }
    }
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| ConfigError::EnvOverride {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests;
