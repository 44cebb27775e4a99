use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;
use crate::policy::UpdateMode;
use crate::provider::ProviderKind;
use crate::retry::RetryPolicy;

/// Upper bound on concurrently running repository operations
pub const MAX_CONCURRENCY: usize = 64;

/// Main configuration structure for repofleet
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory the repositories are mirrored into
    #[serde(default = "default_destination_root")]
    pub destination_root: String,

    /// Provider selection and credentials lookup
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Retry/backoff for provider calls and git operations
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Provider configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    /// Hosting provider (azure-devops, github, bitbucket)
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// API base URL override, e.g. for GitHub Enterprise
    pub base_url: Option<String>,

    /// Environment variable holding the token (provider default if unset)
    pub token_env: Option<String>,

    /// Environment variable holding the username (BitBucket)
    pub username_env: Option<String>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum parallel repository operations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// What to do with repositories that already exist locally
    #[serde(default)]
    pub update_mode: UpdateMode,

    /// Timeout for a single git operation in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Retry configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of each delay randomly added or removed
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Extra regex patterns masked in every log line and report
    #[serde(default)]
    pub mask_patterns: Vec<String>,
}

// Default value functions
fn default_destination_root() -> String {
    "${HOME}/repos".to_string()
}
fn default_provider_kind() -> ProviderKind {
    ProviderKind::AzureDevOps
}
fn default_concurrency() -> usize {
    4
}
fn default_timeout() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: None,
            token_env: None,
            username_env: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            update_mode: UpdateMode::default(),
            timeout: default_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            mask_patterns: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Concurrency limit, `requested` taking precedence, clamped to `1..=MAX_CONCURRENCY`
    pub fn effective_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.concurrency)
            .clamp(1, MAX_CONCURRENCY)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repofleet").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.destination_root = shellexpand::full(&self.destination_root)
            .context("Failed to expand destination_root path")?
            .into_owned();

        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.destination_root.trim().is_empty() {
            return Err(SyncError::Configuration(
                "destination_root must not be empty".to_string(),
            ));
        }
        if self.sync.concurrency == 0 {
            return Err(SyncError::Configuration(
                "sync.concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(SyncError::Configuration(format!(
                "retry.jitter must be between 0 and 1, got {}",
                self.retry.jitter
            )));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(SyncError::Configuration(format!(
                "retry.multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    pub fn destination_path(&self) -> PathBuf {
        PathBuf::from(&self.destination_root)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            destination_root: default_destination_root(),
            provider: ProviderConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
