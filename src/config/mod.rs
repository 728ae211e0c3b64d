// Configuration management module
// Loads and validates the TOML surface consumed by storage and vector indexing

pub mod settings;

pub use settings::{
    BlobStoreSettings, Config, ConfigError, DEFAULT_EMBEDDING_DIMENSION,
    DEFAULT_VECTOR_FIELD_PATH, DocumentNativeSettings, DocumentStoreSettings, LocalDiskSettings,
    ManagedSearchSettings, OllamaConfig, StorageConfig, VectorIndexConfig,
};

/// Get the default configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::default_dir()
}
