use super::schema::RetraceConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from default locations:
    /// 1. ./retrace.yaml
    /// 2. ~/.retrace/config.yaml
    /// 3. Default configuration
    pub async fn load_default() -> Result<RetraceConfig, ConfigError> {
        let home = dirs::home_dir();
        match Self::locate(Path::new("."), home.as_deref()) {
            Some(path) => Self::load_from(&path).await,
            None => {
                debug!("no config file found; using built-in defaults");
                Ok(RetraceConfig::default())
            }
        }
    }

    /// First existing config file, checking `dir` before `home`.
    pub fn locate(dir: &Path, home: Option<&Path>) -> Option<PathBuf> {
        let local = dir.join("retrace.yaml");
        let from_home = home.map(|h| h.join(".retrace").join("config.yaml"));
        std::iter::once(local)
            .chain(from_home)
            .find(|candidate| candidate.is_file())
    }

    pub async fn load_from(path: &Path) -> Result<RetraceConfig, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: RetraceConfig = serde_yaml::from_str(&content)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
