//! Configuration management for iotbackendfinder
//!
//! Run settings are loaded from `./config/iotbackendfinder.toml` (or the path
//! given with `--config`). The template written by `--init` is the single
//! source of defaults; optional sections fall back to the same values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file path relative to working directory
pub const CONFIG_PATH: &str = "./config/iotbackendfinder.toml";

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = include_str!("../config/iotbackendfinder.toml");

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "DNSDB_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid regex pattern '{pattern_name}': {error}\n  Pattern: {pattern}")]
    InvalidRegex {
        pattern_name: String,
        pattern: String,
        error: String,
    },

    #[error("Invalid URL in '{field}': {url}")]
    InvalidUrl { field: String, url: String },

    #[error("Configuration field '{field}' cannot be empty")]
    EmptyRequired { field: String },

    #[error("Configuration field '{field}' must be greater than zero")]
    ZeroValue { field: String },

    #[error("Provider '{0}' has no match rules")]
    NoRules(String),

    #[error("Provider '{0}' is defined more than once")]
    DuplicateProvider(String),

    #[error("Unknown provider '{0}' (not in the pattern catalog)")]
    UnknownProvider(String),

    #[error("Pattern catalog defines no providers")]
    EmptyCatalog,

    #[error("Missing DNSDB API key: set run.api_key, --api-key or {API_KEY_ENV}")]
    MissingCredential,
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub dnsdb: DnsdbConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
}

/// Per-run key-value settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    /// DNSDB API credential
    #[serde(default)]
    pub api_key: Option<String>,
    /// Local bulk export file or directory (Censys path)
    #[serde(default)]
    pub input_file_path: Option<PathBuf>,
    /// Destination for filtered matches
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Subset of catalog providers to run; empty means all
    #[serde(default)]
    pub providers: Vec<String>,
    /// Alternate pattern catalog; the embedded catalog is used when unset
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    /// Prefix output file names with the run's UTC timestamp
    #[serde(default = "default_true")]
    pub timestamp_output: bool,
}

fn default_true() -> bool {
    true
}

/// HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "iotbackendfinder/0.1".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Which seed queries of each provider are issued
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QuerySelection {
    Basic,
    Flexible,
    Both,
}

/// DNSDB remote API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DnsdbConfig {
    pub base_url: String,
    /// Results requested per page
    pub page_size: u32,
    /// Only return rrsets last seen after this unix timestamp
    pub time_last_after: Option<i64>,
    pub query_selection: QuerySelection,
    /// rrtype used when chasing CNAME targets
    pub chase_rrtype: String,
}

impl Default for DnsdbConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dnsdb.info".to_string(),
            page_size: 10000,
            time_last_after: Some(1609459200),
            query_selection: QuerySelection::Both,
            chase_rrtype: "ANY".to_string(),
        }
    }
}

/// Backoff strategy for retried requests
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy '{}'", other)),
        }
    }
}

/// Throttling and retry configuration for the remote API
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second allowed against the remote API (must be > 0)
    pub requests_per_second: u32,
    pub backoff_strategy: BackoffStrategy,
    pub max_retries: u32,
    pub backoff_base_delay_ms: u64,
    pub backoff_max_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            backoff_strategy: BackoffStrategy::Exponential,
            max_retries: 3,
            backoff_base_delay_ms: 1000,
            backoff_max_delay_ms: 30000,
        }
    }
}

impl RateLimitConfig {
    /// Delay before retry `attempt` (1-indexed); attempt 0 never waits
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.backoff_base_delay_ms;
        let delay_ms = match self.backoff_strategy {
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay_ms.min(self.backoff_max_delay_ms))
    }
}

/// Provider run scheduling
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Providers processed concurrently
    pub concurrency: usize,
    /// Maximum CNAME hops followed from a seed query
    pub max_chase_depth: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_chase_depth: 1,
        }
    }
}

/// Bulk export processing
#[derive(Debug, Clone, Deserialize)]
pub struct BulkConfig {
    /// Files processed in parallel
    pub workers: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

impl AppConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Path::new(CONFIG_PATH))
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.user_agent.is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "http.user_agent".to_string(),
            });
        }
        if self.http.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue {
                field: "http.request_timeout_secs".to_string(),
            });
        }

        if !self.dnsdb.base_url.starts_with("https://") && !self.dnsdb.base_url.starts_with("http://") {
            return Err(ConfigError::InvalidUrl {
                field: "dnsdb.base_url".to_string(),
                url: self.dnsdb.base_url.clone(),
            });
        }
        if self.dnsdb.page_size == 0 {
            return Err(ConfigError::ZeroValue {
                field: "dnsdb.page_size".to_string(),
            });
        }
        if self.dnsdb.chase_rrtype.is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "dnsdb.chase_rrtype".to_string(),
            });
        }

        // Throttling is mandatory
        if self.rate_limit.requests_per_second == 0 {
            return Err(ConfigError::ZeroValue {
                field: "rate_limit.requests_per_second".to_string(),
            });
        }

        if self.analysis.concurrency == 0 {
            return Err(ConfigError::ZeroValue {
                field: "analysis.concurrency".to_string(),
            });
        }
        if self.bulk.workers == 0 {
            return Err(ConfigError::ZeroValue {
                field: "bulk.workers".to_string(),
            });
        }

        if self.run.providers.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::EmptyRequired {
                field: "run.providers[]".to_string(),
            });
        }

        Ok(())
    }

    /// Resolve the DNSDB credential: explicit setting first, then the environment
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        self.run
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()))
            .ok_or(ConfigError::MissingCredential)
    }

    /// Create default configuration file at the standard location
    pub fn create_default_config() -> Result<PathBuf, ConfigError> {
        let path = Path::new(CONFIG_PATH);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;

        Ok(path.to_path_buf())
    }
}
