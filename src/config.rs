use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Maximum number of cached photos (each with its embedding and metadata).
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Maximum bytes of cached record data.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Hard quota enforced by the storage backend itself, if any.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picsync")
        .join("cache.db")
}

fn default_max_records() -> usize {
    5000
}

fn default_max_bytes() -> u64 {
    256 * 1024 * 1024 // 256MB
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
            quota_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a transiently failing action is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Replayed requests taking longer than this are aborted and retried.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Status flips shorter than this are ignored.
    #[serde(default = "default_min_dwell_ms")]
    pub min_dwell_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_heartbeat_timeout_ms() -> u64 {
    3000
}

fn default_min_dwell_ms() -> u64 {
    2000
}

impl ConnectivityConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.min_dwell_ms)
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            min_dwell_ms: default_min_dwell_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Keyword weight when blending a text query with similarity.
    #[serde(default = "default_text_alpha")]
    pub text_alpha: f32,

    /// Keyword weight when blending a "more like this" query.
    #[serde(default = "default_similar_alpha")]
    pub similar_alpha: f32,

    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_text_alpha() -> f32 {
    0.7
}

fn default_similar_alpha() -> f32 {
    0.3
}

fn default_search_limit() -> usize {
    50
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_alpha: default_text_alpha(),
            similar_alpha: default_similar_alpha(),
            limit: default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Library directories refreshed after every successful drain.
    #[serde(default)]
    pub library_dirs: Vec<String>,
}

fn default_remote_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: default_remote_endpoint(),
            api_key: None,
            library_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Delay before the first retry of a failed sync cycle; doubles with
    /// each consecutive failure.
    #[serde(default = "default_error_retry_ms")]
    pub error_retry_ms: u64,

    #[serde(default = "default_max_error_retry_ms")]
    pub max_error_retry_ms: u64,
}

fn default_error_retry_ms() -> u64 {
    5_000
}

fn default_max_error_retry_ms() -> u64 {
    300_000 // 5 minutes
}

impl SyncConfig {
    /// Delay before retrying after `failures` consecutive failed cycles.
    pub fn error_retry(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let ms = self.error_retry_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_error_retry_ms))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            error_retry_ms: default_error_retry_ms(),
            max_error_retry_ms: default_max_error_retry_ms(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("picsync")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PICSYNC_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
