use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::protocol::{PROD_ENDPOINT, STG_ENDPOINT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Where durable records and transient preview files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Directory for transient preview files.  Everything in here is
    /// released on teardown, so it may be wiped at any time.
    #[serde(default = "default_preview_dir")]
    pub preview_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
    /// Name or URL of the endpoint selected at startup.
    #[serde(default = "default_endpoint")]
    pub default_endpoint: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Capacity of the queue between a debouncer and its worker.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Files must be strictly smaller than this.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            preview_dir: default_preview_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            default_endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_db_path() -> PathBuf {
    platform::data_dir().join("aid-bench.sqlite3")
}

fn default_preview_dir() -> PathBuf {
    platform::cache_dir().join("previews")
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![
        EndpointConfig {
            name: "stg".to_string(),
            url: STG_ENDPOINT.to_string(),
        },
        EndpointConfig {
            name: "prod".to_string(),
            url: PROD_ENDPOINT.to_string(),
        },
    ]
}

fn default_endpoint() -> String {
    "stg".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_queue_depth() -> usize {
    16
}

fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024
}

impl ApiConfig {
    /// Resolve a user-supplied endpoint selector.  A configured name wins;
    /// anything that looks like an absolute http(s) URL is taken literally.
    pub fn resolve_endpoint(&self, selector: &str) -> Option<String> {
        let selector = selector.trim();
        if let Some(endpoint) = self
            .endpoints
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(selector))
        {
            return Some(endpoint.url.clone());
        }
        if selector.starts_with("http://") || selector.starts_with("https://") {
            return Some(selector.trim_end_matches('/').to_string());
        }
        None
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            api: ApiConfig::default(),
            pipeline: PipelineConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}
