//! Persistent CLI configuration.

use std::path::{Path, PathBuf};

use memosync_core::util::{is_http_url, normalize_text_option};
use memosync_core::EngineConfig;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "cli-config.json";
const REMOTE_URL_ENV: &str = "MEMOSYNC_REMOTE_URL";
const AUTH_TOKEN_ENV: &str = "MEMOSYNC_AUTH_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    /// Base URL of the sync API
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("memosync").join(CONFIG_FILE_NAME))
}

impl CliConfig {
    /// Load the user config file, then apply environment overrides
    pub fn load() -> Result<Self, String> {
        let config = match default_config_path() {
            Some(path) => Self::load_from_path(&path)?,
            None => Self::default(),
        };
        Ok(config.with_overrides(
            std::env::var(REMOTE_URL_ENV).ok(),
            std::env::var(AUTH_TOKEN_ENV).ok(),
        ))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    /// Non-empty values win over what the file says
    #[must_use]
    pub fn with_overrides(mut self, remote_url: Option<String>, auth_token: Option<String>) -> Self {
        if let Some(url) = normalize_text_option(remote_url) {
            self.remote_url = Some(url);
        }
        if let Some(token) = normalize_text_option(auth_token) {
            self.auth_token = Some(token);
        }
        self
    }

    /// The configured remote, if any. Rejects non-HTTP URLs.
    pub fn remote_url(&self) -> Result<Option<&str>, String> {
        match self.remote_url.as_deref() {
            Some(url) if !is_http_url(url) => Err(format!(
                "remote_url must start with http:// or https:// (got {url})"
            )),
            other => Ok(other),
        }
    }

    fn normalize(&mut self) {
        self.remote_url = normalize_text_option(self.remote_url.take());
        self.auth_token = normalize_text_option(self.auth_token.take());
    }
}
