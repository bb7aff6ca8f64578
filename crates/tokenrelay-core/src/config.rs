//! Client configuration management.
//!
//! Holds the API base URL, the refresh endpoint, the request timeout, where
//! the session is persisted, and which calls may be replayed after a
//! refresh. Configuration is stored at `~/.config/tokenrelay/config.json`;
//! a handful of `TOKENRELAY_*` environment variables override it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::ReplayPolicy;
use crate::storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tokenrelay";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// HTTP request timeout in seconds, also applied to the refresh call.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: Option<String>,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
    pub keyring_service: String,
    pub replay: ReplayPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage: StorageBackend::default(),
            keyring_service: APP_NAME.to_string(),
            replay: ReplayPolicy::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `TOKENRELAY_BASE_URL`, `TOKENRELAY_REFRESH_PATH` and
    /// `TOKENRELAY_TIMEOUT_SECS` on top of the loaded values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("TOKENRELAY_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(path) = var("TOKENRELAY_REFRESH_PATH") {
            self.refresh_path = path;
        }
        if let Some(secs) = var("TOKENRELAY_TIMEOUT_SECS") {
            self.request_timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid TOKENRELAY_TIMEOUT_SECS: {}", secs))?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No base_url configured (set TOKENRELAY_BASE_URL)"))
    }

    pub fn refresh_url(&self) -> Result<String> {
        Ok(join_url(self.base_url()?, &self.refresh_path))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the durable store selected by `storage`
    pub fn open_store(&self) -> Result<Arc<dyn KeyValueStore>> {
        let store: Arc<dyn KeyValueStore> = match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(self.cache_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new(self.keyring_service.clone())),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}

/// Join a base URL and a path with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
