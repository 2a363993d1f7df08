//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/lifeline/config.toml)
//! 3. Environment variables (LIFELINE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::events::ChannelSettings;
use crate::queue::{QueueSettings, DEFAULT_MAX_RETRIES};
use crate::transport::TransportSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "LIFELINE";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local state (credentials, queue and entity database)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the REST API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// WebSocket URL for live events; derived from `api_url` when unset
    #[serde(default)]
    pub events_url: Option<String>,

    /// Whether to hold a live event connection while signed in
    #[serde(default = "default_true")]
    pub realtime_enabled: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Offline queue policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Queued actions older than this are dropped on startup
    pub eviction_horizon_hours: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            eviction_horizon_hours: 24,
        }
    }
}

/// Event channel reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub base_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Session and request retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Refresh the access token when it expires within this many seconds
    pub refresh_horizon_secs: i64,
    /// Wait after a 429 that carries no Retry-After
    pub rate_limit_fallback_secs: u64,
    /// Longer Retry-After hints are left to the queue's backoff
    pub max_rate_limit_wait_secs: u64,
    pub server_retry_delay_ms: u64,
    pub login_path: String,
    pub refresh_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_horizon_secs: 300,
            rate_limit_fallback_secs: 5,
            max_rate_limit_wait_secs: 30,
            server_retry_delay_ms: 1_000,
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: default_api_url(),
            events_url: None,
            realtime_enabled: true,
            request_timeout_secs: default_request_timeout_secs(),
            log_file: None,
            queue: QueueConfig::default(),
            realtime: RealtimeConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LIFELINE_DATA_DIR, LIFELINE_API_URL,
    ///    LIFELINE_EVENTS_URL, LIFELINE_REALTIME_ENABLED)
    /// 2. Config file (~/.config/lifeline/config.toml or LIFELINE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `path` if given, otherwise from the default location
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // LIFELINE_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // LIFELINE_API_URL
        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.api_url = val;
            }
        }

        // LIFELINE_EVENTS_URL
        if let Ok(val) = std::env::var(format!("{}_EVENTS_URL", ENV_PREFIX)) {
            self.events_url = if val.is_empty() { None } else { Some(val) };
        }

        // LIFELINE_REALTIME_ENABLED
        if let Ok(val) = std::env::var(format!("{}_REALTIME_ENABLED", ENV_PREFIX)) {
            self.realtime_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LIFELINE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lifeline")
            .join("config.toml")
    }

    /// Root of the file-backed store (credentials)
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Get the path to the SQLite database (queue and entities)
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("lifeline.db")
    }

    /// Live event endpoint
    ///
    /// Without an explicit `events_url`, the API URL's scheme is switched to
    /// ws/wss and `/events` appended.
    pub fn resolved_events_url(&self) -> String {
        if let Some(url) = &self.events_url {
            return url.clone();
        }
        let base = self.api_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/events", ws)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_retries: self.queue.max_retries,
            backoff: Backoff::new(
                Duration::from_millis(self.queue.base_retry_delay_ms),
                Duration::from_millis(self.queue.max_retry_delay_ms),
            ),
            eviction_horizon: chrono::Duration::hours(self.queue.eviction_horizon_hours),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            refresh_horizon: chrono::Duration::seconds(self.auth.refresh_horizon_secs),
            rate_limit_fallback: Duration::from_secs(self.auth.rate_limit_fallback_secs),
            max_rate_limit_wait: Duration::from_secs(self.auth.max_rate_limit_wait_secs),
            server_retry_delay: Duration::from_millis(self.auth.server_retry_delay_ms),
            login_path: self.auth.login_path.clone(),
            refresh_path: self.auth.refresh_path.clone(),
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            backoff: Backoff::new(
                Duration::from_millis(self.realtime.base_reconnect_delay_ms),
                Duration::from_millis(self.realtime.max_reconnect_delay_ms),
            ),
            max_attempts: self.realtime.max_reconnect_attempts,
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lifeline")
}

fn default_api_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}
