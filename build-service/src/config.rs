// Service Configuration
// Lease, retention and container backend settings, loaded from YAML

use crate::exec::ReleasePolicy;
use crate::resource::{
    ContainerProvider, DockerConfig, DockerProvider, LocalConfig, LocalProvider, ResourceError,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Container backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Docker(DockerConfig),
    Local(LocalConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local(LocalConfig::default())
    }
}

impl BackendConfig {
    /// Instantiate the configured provider; a Docker backend must have a responding daemon
    pub async fn provider(&self) -> Result<Arc<dyn ContainerProvider>, ResourceError> {
        Ok(match self {
            BackendConfig::Docker(config) => {
                let provider = DockerProvider::with_config(config.clone())?;
                if !provider.is_available().await {
                    return Err(ResourceError::DockerNotAvailable(
                        "docker daemon is not responding".to_string(),
                    ));
                }
                Arc::new(provider)
            }
            BackendConfig::Local(config) => Arc::new(LocalProvider::with_config(config.clone())),
        })
    }
}

/// Top-level configuration of the build service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Lease on a build's tracking lock, in seconds
    pub tracking_lease_secs: u64,

    /// How long containers of successful steps are kept, in seconds
    pub successful_ttl_secs: u64,

    /// How long containers of failed steps are kept, in seconds
    pub failed_ttl_secs: u64,

    pub backend: BackendConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tracking_lease_secs: 60,
            successful_ttl_secs: 60 * 60,
            failed_ttl_secs: 5 * 60,
            backend: BackendConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Parse configuration from YAML
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break tracking
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking_lease_secs == 0 {
            return Err(ConfigError::Invalid(
                "tracking_lease_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Location of the user's config file, `~/.keel/config.yml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".keel").join("config.yml"))
    }

    /// Load from `path` if given, else from the default path when it exists, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn tracking_lease(&self) -> Duration {
        Duration::from_secs(self.tracking_lease_secs)
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy {
            successful: Duration::from_secs(self.successful_ttl_secs),
            failed: Duration::from_secs(self.failed_ttl_secs),
        }
    }
}
