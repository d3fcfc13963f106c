use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::constants;

/// Which URLs the proxy is willing to cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UrlFilterKind {
    /// Accept every URL
    #[default]
    Any,
    /// Only accept URLs starting with `http`
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCacheConfig {
    /// Directory to store cached files
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    /// Largest resource (in bytes) that will be written to disk; bigger ones are only streamed
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Keep at most this many files in the cache directory
    #[serde(default)]
    pub max_file_count: Option<u64>,

    /// Keep the cache directory below this many bytes
    #[serde(default)]
    pub max_total_size: Option<u64>,

    /// Evict any single file at or above this many bytes
    #[serde(default)]
    pub max_single_file_size: Option<u64>,

    /// Number of ping attempts before the proxy is considered unreachable
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout of the first ping attempt in milliseconds, doubled on every retry
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Minimum interval between two progress notifications in milliseconds
    #[serde(default = "default_callback_interval_ms")]
    pub callback_interval_ms: u64,

    #[serde(default)]
    pub url_filter: UrlFilterKind,

    /// Headers sent with every upstream request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for ProxyCacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: None,
            max_file_size: default_max_file_size(),
            max_file_count: None,
            max_total_size: None,
            max_single_file_size: None,
            max_attempts: default_max_attempts(),
            max_timeout_ms: default_max_timeout_ms(),
            callback_interval_ms: default_callback_interval_ms(),
            url_filter: UrlFilterKind::default(),
            headers: HashMap::new(),
        }
    }
}

impl ProxyCacheConfig {
    /// Load from the default location, writing the defaults there on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            info!("No config file found, using defaults");
            let config = Self::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        info!("Config loaded successfully");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be greater than 0"));
        }

        if self.max_timeout_ms == 0 {
            return Err(anyhow::anyhow!("max_timeout_ms must be greater than 0"));
        }

        if self.callback_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "callback_interval_ms must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Get the cache directory path, using the platform default if not set
    pub fn cache_directory(&self) -> Result<PathBuf> {
        match &self.cache_directory {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_cache_directory(),
        }
    }

    /// `~/.cache/streamcache/media` on Linux, `~/Library/Caches/streamcache/media` on macOS
    pub fn default_cache_directory() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().context("Failed to get cache directory")?;
        Ok(cache_dir.join("streamcache").join("media"))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn callback_interval(&self) -> Duration {
        Duration::from_millis(self.callback_interval_ms)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("streamcache").join("config.toml"))
    }
}

fn default_max_file_size() -> u64 {
    i32::MAX as u64
}
fn default_max_attempts() -> u32 {
    constants::ATTEMPTS
}
fn default_max_timeout_ms() -> u64 {
    constants::TIMEOUT_MS
}
fn default_callback_interval_ms() -> u64 {
    constants::CALLBACK_INTERVAL_MS
}
