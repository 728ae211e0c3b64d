
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::storage::StorageKind;

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
pub const DEFAULT_VECTOR_FIELD_PATH: &str = "embedding.vector";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub strategy: StorageKind,
    pub operation_timeout_secs: u64,
    pub max_retries: u32,
    /// Upper bound on concurrent strategy calls; unbounded when absent
    pub max_concurrent_operations: Option<usize>,
    pub local: LocalDiskSettings,
    pub blob: BlobStoreSettings,
    pub document: DocumentStoreSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            strategy: StorageKind::LocalDisk,
            operation_timeout_secs: 30,
            max_retries: 3,
            max_concurrent_operations: None,
            local: LocalDiskSettings::default(),
            blob: BlobStoreSettings::default(),
            document: DocumentStoreSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LocalDiskSettings {
    /// Root directory for model folders; `<base_dir>/models` when absent
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlobStoreSettings {
    /// Blob gateway endpoint; an in-process container is used when absent
    pub endpoint: Option<String>,
    pub container: String,
    /// Name of the environment variable holding the access key
    pub access_key_env: Option<String>,
}

impl Default for BlobStoreSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            container: "semantic-models".to_string(),
            access_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DocumentStoreSettings {
    /// SQLite database file; `<base_dir>/documents.db` when absent
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorIndexConfig {
    /// One of `auto`, `in-memory`, `managed-search`, `document-native`
    pub provider: String,
    pub collection: String,
    pub push_on_generate: bool,
    pub provision: bool,
    pub expected_dimension: u32,
    /// One of `ollama`, `mock`
    pub embedding_service: String,
    pub parallelism: usize,
    pub hybrid_search: bool,
    pub managed_search: ManagedSearchSettings,
    pub document_native: DocumentNativeSettings,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            collection: "semantic-entities".to_string(),
            push_on_generate: false,
            provision: false,
            expected_dimension: DEFAULT_EMBEDDING_DIMENSION,
            embedding_service: "ollama".to_string(),
            parallelism: 4,
            hybrid_search: true,
            managed_search: ManagedSearchSettings::default(),
            document_native: DocumentNativeSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagedSearchSettings {
    /// LanceDB connection URI (local path or remote URI)
    pub uri: Option<String>,
    pub distance_function: String,
    pub index_type: String,
}

impl Default for ManagedSearchSettings {
    fn default() -> Self {
        Self {
            uri: None,
            distance_function: "cosine".to_string(),
            index_type: "flat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DocumentNativeSettings {
    pub vector_field_path: String,
    pub distance_function: String,
    pub index_type: String,
}

impl Default for DocumentNativeSettings {
    fn default() -> Self {
        Self {
            vector_field_path: DEFAULT_VECTOR_FIELD_PATH.to_string(),
            distance_function: "cosine".to_string(),
            index_type: "quantized".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid operation timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid retry count: {0} (must be at most 10)")]
    InvalidRetries(u32),
    #[error("Invalid max concurrent operations: {0} (must be at least 1)")]
    InvalidConcurrency(usize),
    #[error("Invalid blob container name: {0:?} (lowercase letters, digits and '-' only)")]
    InvalidContainer(String),
    #[error("Invalid expected dimension: {0} (must be a positive integer)")]
    InvalidDimension(u32),
    #[error("Invalid parallelism: {0} (must be between 1 and 64)")]
    InvalidParallelism(usize),
    #[error("Invalid collection name: {0:?} (cannot be empty)")]
    InvalidCollection(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for crate::StoreError {
    #[inline]
    fn from(error: ConfigError) -> Self {
        Self::Configuration(error.to_string())
    }
}

impl Config {
    /// Default configuration directory for the current user
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("semantic-store"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".semantic-store")))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self::with_base_dir(config_dir));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.ollama.validate()?;
        self.vector_index.validate()?;
        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Root directory for the local disk strategy
    #[inline]
    pub fn local_root(&self) -> PathBuf {
        self.storage
            .local
            .root
            .clone()
            .unwrap_or_else(|| self.get_base_dir().join("models"))
    }

    /// SQLite file backing the document store strategy
    #[inline]
    pub fn document_database_path(&self) -> PathBuf {
        self.storage
            .document
            .database_path
            .clone()
            .unwrap_or_else(|| self.get_base_dir().join("documents.db"))
    }
}

impl StorageConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=600).contains(&self.operation_timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.operation_timeout_secs));
        }

        if self.max_retries > 10 {
            return Err(ConfigError::InvalidRetries(self.max_retries));
        }

        if let Some(limit) = self.max_concurrent_operations {
            if limit == 0 {
                return Err(ConfigError::InvalidConcurrency(limit));
            }
        }

        let container = &self.blob.container;
        if container.is_empty()
            || !container
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::InvalidContainer(container.clone()));
        }

        if let Some(endpoint) = &self.blob.endpoint {
            Url::parse(endpoint).map_err(|_| ConfigError::InvalidUrl(endpoint.clone()))?;
        }

        Ok(())
    }

    #[inline]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl OllamaConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}

impl VectorIndexConfig {
    /// Shape checks only; provider compatibility is resolved by the vector index policy
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expected_dimension == 0 {
            return Err(ConfigError::InvalidDimension(self.expected_dimension));
        }

        if !(1..=64).contains(&self.parallelism) {
            return Err(ConfigError::InvalidParallelism(self.parallelism));
        }

        if self.collection.trim().is_empty() {
            return Err(ConfigError::InvalidCollection(self.collection.clone()));
        }

        if let Some(uri) = &self.managed_search.uri {
            if uri.trim().is_empty() {
                return Err(ConfigError::InvalidUrl(uri.clone()));
            }
        }

        Ok(())
    }
}
