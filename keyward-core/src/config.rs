use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SessionAlgorithm;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Client-side knobs for talking to the Secret Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Session algorithm requested from the service.
    #[serde(default)]
    pub algorithm: SessionAlgorithm,
    /// Whether `open_session` may fall back to `plain` when the service rejects
    /// the encrypted algorithm. The fallback is always logged and reported on
    /// the returned session.
    #[serde(default = "default_allow_plain_fallback")]
    pub allow_plain_fallback: bool,
    /// How long to wait for a prompt's `Completed` signal.
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    /// Window handle passed to `Prompt.Prompt()`.
    #[serde(default)]
    pub prompt_window_id: String,
    /// Collection alias (or full object path) new items are stored in.
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            algorithm: SessionAlgorithm::default(),
            allow_plain_fallback: default_allow_plain_fallback(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            prompt_window_id: String::new(),
            collection: default_collection(),
        }
    }
}

impl ClientConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}

fn default_allow_plain_fallback() -> bool {
    true
}

fn default_prompt_timeout_secs() -> u64 {
    120
}

fn default_collection() -> String {
    "default".to_string()
}
