use crate::paths::AppPaths;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub base_url: String,
    /// Only items from this author are kept; empty disables the filter.
    #[serde(default)]
    pub author_id: String,
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com/v2/posts".to_string(),
            author_id: String::new(),
            page_size: 50,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebdavConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Remote directory the upload sweep places files under.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
}

fn default_remote_root() -> String {
    "fanvault".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub cleanup_retention_days: i64,
    pub fetch_interval_minutes: u64,
    pub upload_interval_minutes: u64,
    #[serde(default)]
    pub webdav: Option<WebdavConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            retry: RetryConfig::default(),
            cleanup_retention_days: 7,
            fetch_interval_minutes: 120,
            upload_interval_minutes: 60,
            webdav: None,
        }
    }
}

pub fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let path = paths.config_file_path();
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: AppConfig = serde_json::from_slice(&bytes).map_err(|e| {
        VaultError::InvalidInput(format!(
            "failed to parse config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_config(paths: &AppPaths, config: &AppConfig) -> Result<()> {
    let path = paths.config_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
