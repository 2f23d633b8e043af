//! Configuration management for Place Core.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Includes sync-related configuration:
//! - client_id: UUID7 identifying this client (generated on first run)
//! - remote: endpoint and bearer credential for the remote entity store
//! - retry and deduplication tuning

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PlaceError, PlaceResult};

/// Remote entity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the remote store, without a trailing slash
    #[serde(default)]
    pub base_url: String,
    /// Bearer token attached to outgoing requests
    #[serde(default)]
    pub bearer_token: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bearer_token: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Retry tuning for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per operation (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds; attempt n waits base * 2^n
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Rounds of conflict resolution before a record is marked conflicted
    #[serde(default = "default_conflict_rounds")]
    pub conflict_rounds: u32,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_conflict_rounds() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            conflict_rounds: default_conflict_rounds(),
        }
    }
}

/// Deduplication tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Minimum name similarity (0.0 to 1.0) for a fuzzy match
    #[serde(default = "default_name_similarity_threshold")]
    pub name_similarity_threshold: f64,
    /// Maximum great-circle distance in kilometers for a fuzzy match
    #[serde(default = "default_max_distance_km")]
    pub max_distance_km: f64,
}

fn default_name_similarity_threshold() -> f64 {
    0.8
}

fn default_max_distance_km() -> f64 {
    0.1
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            name_similarity_threshold: default_name_similarity_threshold(),
            max_distance_km: default_max_distance_km(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Client ID (UUID7 hex)
    #[serde(default = "generate_client_id")]
    pub client_id: String,
    /// Human-readable client name
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Remote store configuration
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Retry tuning
    #[serde(default)]
    pub retry: RetryConfig,
    /// Deduplication tuning
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Maximum records synced concurrently by a sweep
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
}

fn generate_client_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn default_client_name() -> String {
    "Atlas Client".to_string()
}

fn default_sweep_concurrency() -> usize {
    4
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            client_id: generate_client_id(),
            client_name: default_client_name(),
            remote: RemoteConfig::default(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            sweep_concurrency: default_sweep_concurrency(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager rooted at `config_dir`
    pub fn new(config_dir: PathBuf) -> PlaceResult<Self> {
        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => {
                    serde_json::from_str(&content).unwrap_or_else(|_| Self::defaults(&config_dir))
                }
                Err(_) => Self::defaults(&config_dir),
            }
        } else {
            Self::defaults(&config_dir)
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Build a config entirely in memory (for testing)
    pub fn in_memory(data: ConfigData) -> Self {
        Self {
            config_dir: PathBuf::new(),
            config_file: PathBuf::new(),
            data,
        }
    }

    fn defaults(config_dir: &Path) -> ConfigData {
        let mut default = ConfigData::default();
        default.database_file = config_dir.join("places.db").to_string_lossy().to_string();
        default
    }

    /// Save configuration to file
    pub fn save(&self) -> PlaceResult<()> {
        if self.config_file.as_os_str().is_empty() {
            return Ok(());
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the client ID as hex string
    pub fn client_id_hex(&self) -> &str {
        &self.data.client_id
    }

    /// Get the client ID as a UUID
    pub fn client_id(&self) -> PlaceResult<Uuid> {
        Uuid::parse_str(&self.data.client_id)
            .map_err(|e| PlaceError::Config(format!("Invalid client_id: {}", e)))
    }

    /// Get the human-readable client name
    pub fn client_name(&self) -> &str {
        &self.data.client_name
    }

    /// Get remote store configuration
    pub fn remote(&self) -> &RemoteConfig {
        &self.data.remote
    }

    /// Set the remote base URL and bearer token
    pub fn set_remote(&mut self, base_url: &str, bearer_token: &str) -> PlaceResult<()> {
        self.data.remote.base_url = base_url.trim_end_matches('/').to_string();
        self.data.remote.bearer_token = bearer_token.to_string();
        self.save()
    }

    /// Replace the bearer token (after an opaque refresh)
    pub fn set_bearer_token(&mut self, token: &str) -> PlaceResult<()> {
        self.data.remote.bearer_token = token.to_string();
        self.save()
    }

    /// Get retry tuning
    pub fn retry(&self) -> &RetryConfig {
        &self.data.retry
    }

    /// Get deduplication tuning
    pub fn dedup(&self) -> &DedupConfig {
        &self.data.dedup
    }

    /// Get sweep concurrency limit
    pub fn sweep_concurrency(&self) -> usize {
        self.data.sweep_concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let data = ConfigData::default();
        assert_eq!(data.retry.max_attempts, 4);
        assert_eq!(data.retry.base_delay_ms, 1000);
        assert_eq!(data.retry.conflict_rounds, 3);
        assert_eq!(data.dedup.name_similarity_threshold, 0.8);
        assert_eq!(data.dedup.max_distance_km, 0.1);
        assert_eq!(data.client_id.len(), 32);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let mut config = Config::new(dir.path().to_path_buf()).unwrap();
            config.set_remote("https://api.example.com/", "token-1").unwrap();
        }

        let reloaded = Config::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.remote().base_url, "https://api.example.com");
        assert_eq!(reloaded.remote().bearer_token, "token-1");
    }

    #[test]
    fn test_corrupt_config_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.json"), "{not json").unwrap();

        let config = Config::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.retry().max_attempts, 4);
    }
}
