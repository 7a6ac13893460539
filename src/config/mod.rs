// ABOUTME: Configuration types and parsing for sshpipe.yml.
// ABOUTME: Handles file discovery, YAML parsing and env var interpolation.

mod env_value;
mod host;

pub use env_value::{EnvValue, resolve_optional};
pub use host::{HostConfig, ProxyConfig};

use crate::error::{Error, Result};
use crate::ssh::SessionConfig;
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_FILENAME: &str = "sshpipe.yml";
pub const CONFIG_FILENAME_ALT: &str = "sshpipe.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".sshpipe/config.yml";

/// Top-level config file: the target host, optionally behind a proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub target: HostConfig,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                tracing::debug!("loading config from {}", path.display());
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    /// Point the config at another server, keeping everything else.
    pub fn with_server(self, server: &str) -> Result<Self> {
        Ok(Self {
            target: self.target.with_server(server)?,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        self.target.session_config()
    }
}
