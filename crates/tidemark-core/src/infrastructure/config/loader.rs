use std::path::{
    Path,
    PathBuf,
};

use thiserror::Error;

use super::interpolation::{
    interpolate_toml,
    InterpolationError,
};
use super::schema::TidemarkConfig;

pub const CONFIG_PATH_ENV: &str = "TIDEMARK_CONFIG_PATH";

const CONFIG_FILE_NAME: &str = "tidemark.toml";

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Environment variable interpolation failed: {0}")]
    InterpolationError(#[from] InterpolationError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ConfigLoadResult<T> = Result<T, ConfigLoadError>;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolution order: explicit path, `TIDEMARK_CONFIG_PATH`, the user
    /// config directory, then `./tidemark.toml`
    pub fn discover_config_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            tracing::debug!("Using config path from {}: {}", CONFIG_PATH_ENV, path);
            return PathBuf::from(path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("tidemark").join(CONFIG_FILE_NAME);
            if path.exists() {
                tracing::debug!("Using user config path: {}", path.display());
                return path;
            }
        }

        let fallback = PathBuf::from(CONFIG_FILE_NAME);
        tracing::debug!("Using fallback config path: {}", fallback.display());
        fallback
    }

    pub fn load(path: &Path) -> ConfigLoadResult<TidemarkConfig> {
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads `path`, or built-in defaults when nothing exists there
    pub fn load_or_default(path: &Path) -> ConfigLoadResult<TidemarkConfig> {
        match Self::load(path) {
            Err(ConfigLoadError::FileNotFound(missing)) => {
                tracing::warn!(
                    "No config file at {}, using built-in defaults",
                    missing.display()
                );
                Ok(TidemarkConfig::default())
            }
            other => other,
        }
    }

    pub fn parse(content: &str) -> ConfigLoadResult<TidemarkConfig> {
        let mut value: toml::Value = toml::from_str(content)?;

        interpolate_toml(&mut value)?;

        let config: TidemarkConfig = value.try_into().map_err(|e| {
            ConfigLoadError::InvalidConfig(format!("Failed to deserialize config: {}", e))
        })?;

        tracing::debug!(
            backend = %config.storage.backend,
            sources = config.sources.len(),
            "Loaded config"
        );

        Ok(config)
    }
}
