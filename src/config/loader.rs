use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{default_config_path, ConfigError, EngineConfig};

/// Resolves, reads and validates an [`EngineConfig`]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    use_env: bool,
}

impl ConfigLoader {
    /// Load from `path`, or from the per-user default location when `None`
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            use_env: true,
        }
    }

    /// Skip `DATAGEST_*` overrides
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// An explicitly requested file must exist. A missing default file
    /// means built-in defaults.
    pub async fn load(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = match &self.path {
            Some(path) => Self::read(path).await?,
            None => match default_config_path() {
                Some(path) if fs::try_exists(&path).await.unwrap_or(false) => {
                    Self::read(&path).await?
                }
                _ => {
                    debug!("No config file found, using defaults");
                    EngineConfig::default()
                }
            },
        };

        if self.use_env {
            config.merge_env_vars()?;
        }
        config.validate()?;
        Ok(config)
    }

    async fn read(path: &Path) -> Result<EngineConfig, ConfigError> {
        debug!("Loading config from {}", path.display());
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        EngineConfig::from_yaml(&text, path)
    }

    /// Write `config` to `path`, creating parent directories
    pub async fn save(config: &EngineConfig, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let yaml = config
            .to_yaml()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        fs::write(path, yaml).await.map_err(write_err)
    }
}
