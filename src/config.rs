//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section and field has a default, so a partial file (or none at all) is
//! valid. Secrets are referenced by env-var name and resolved at runtime.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::quota::QuotaConfig;
use crate::strategy::{ConvergenceConfig, LayerWeights, StrengthThresholds};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub quota: QuotaConfig,
    pub scanner: ScannerConfig,
    pub analysis: AnalysisConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub data_source: DataSourceConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScannerConfig {
    /// Run the scheduled market scanner.
    pub enabled: bool,
    pub scan_interval_secs: u64,
    /// Hard wall-clock budget for one scan.
    pub budget_secs: u64,
    /// After this long the scan stops paging and returns what it has.
    pub soft_deadline_secs: u64,
    /// Pages of candidates requested at most per scan.
    pub max_pages: u32,
    /// How many top candidates are queued for full analysis.
    pub auto_queue_top: usize,
    /// Interval of the hot-signal monitor.
    pub monitor_interval_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 1800,
            budget_secs: 240,
            soft_deadline_secs: 210,
            max_pages: 10,
            auto_queue_top: 10,
            monitor_interval_secs: 900,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Symbols analysed concurrently within one batch.
    pub batch_concurrency: usize,
    pub signal_ttl_mins: i64,
    /// Hot signals expiring within this many minutes get re-analysed.
    pub refresh_window_mins: i64,
    pub weights: LayerWeights,
    pub thresholds: StrengthThresholds,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 4,
            signal_ttl_mins: 240,
            refresh_window_mins: 60,
            weights: LayerWeights::default(),
            thresholds: StrengthThresholds::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn convergence(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            weights: self.weights,
            thresholds: self.thresholds,
            signal_ttl: Some(chrono::Duration::minutes(self.signal_ttl_mins)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DataSourceConfig {
    pub base_url: String,
    /// Name of the env var holding the bearer token.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".into(),
            api_key_env: Some("THUB_DATA_API_KEY".into()),
            timeout_secs: 30,
        }
    }
}

impl DataSourceConfig {
    /// The bearer token, if the configured env var is set and non-empty.
    pub fn api_key(&self) -> Option<SecretString> {
        let name = self.api_key_env.as_deref()?;
        AppConfig::resolve_env(name)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::new)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON snapshot of the signal store.
    pub snapshot_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "data/signals.json".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let q = &self.quota;
        if q.minute_limit == 0 || q.daily_limit == 0 {
            anyhow::bail!("quota limits must be positive");
        }
        if !(q.safety_buffer > 0.0 && q.safety_buffer <= 1.0) {
            anyhow::bail!("quota.safety_buffer must be in (0, 1], got {}", q.safety_buffer);
        }
        if !(q.warning_ratio > 0.0 && q.warning_ratio <= 1.0) {
            anyhow::bail!("quota.warning_ratio must be in (0, 1], got {}", q.warning_ratio);
        }
        if self.analysis.batch_concurrency == 0 {
            anyhow::bail!("analysis.batch_concurrency must be at least 1");
        }
        if self.scanner.soft_deadline_secs > self.scanner.budget_secs {
            anyhow::bail!("scanner.soft_deadline_secs exceeds scanner.budget_secs");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
