//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which networks the engine may transfer over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Any connected network.
    #[default]
    All,
    /// Only networks that are not metered.
    UnmeteredOnly,
}

/// Callback throttle strategy as it appears in a config file.
///
/// Custom strategies cannot be expressed in a file; pass one to
/// [`DownloadManagerBuilder::with_callback_throttle`](crate::DownloadManagerBuilder::with_callback_throttle).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ThrottleConfig {
    /// At most one update per interval per batch.
    ByTime { interval_ms: u64 },
    /// Only when the integer percentage increases.
    #[default]
    ByProgressIncrease,
}

/// Where downloaded files are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStorage {
    /// Under the engine's state directory.
    Internal,
    /// Under the user-visible download directory.
    #[default]
    External,
}

/// Configuration for the download engine, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Networks transfers are allowed on.
    pub connection_type: ConnectionType,
    /// Whether batches paused for network reasons resume automatically.
    pub network_recovery: bool,
    /// Progress callback throttle.
    pub throttle: ThrottleConfig,
    /// Number of batches transferring at the same time.
    pub max_concurrent_batches: usize,
    /// Storage root for downloaded files.
    pub file_storage: FileStorage,
    /// Directory for batch records (and internal file storage).
    pub state_dir: PathBuf,
    /// Directory for external file storage.
    pub download_dir: PathBuf,
    /// Raise the default log filter to `debug`.
    pub verbose_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            connection_type: ConnectionType::All,
            network_recovery: true,
            throttle: ThrottleConfig::ByProgressIncrease,
            max_concurrent_batches: 1,
            file_storage: FileStorage::External,
            state_dir: data_dir.join("lite-dl"),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            verbose_logging: false,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    #[must_use]
    pub const fn with_network_recovery(mut self, enabled: bool) -> Self {
        self.network_recovery = enabled;
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the number of batches allowed to transfer at once (at least 1).
    #[must_use]
    pub const fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = if max == 0 { 1 } else { max };
        self
    }

    #[must_use]
    pub const fn with_file_storage(mut self, storage: FileStorage) -> Self {
        self.file_storage = storage;
        self
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    #[must_use]
    pub const fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }

    /// Directory holding one record file per batch.
    #[must_use]
    pub fn batches_dir(&self) -> PathBuf {
        self.state_dir.join("batches")
    }

    /// Root under which `<batch id>/<relative path>` files are written.
    #[must_use]
    pub fn storage_root(&self) -> PathBuf {
        match self.file_storage {
            FileStorage::Internal => self.state_dir.join("files"),
            FileStorage::External => self.download_dir.clone(),
        }
    }

    /// Reads a configuration file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed, or if
    /// it asks for zero concurrent batches.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        if config.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "max_concurrent_batches must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Writes the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.connection_type, ConnectionType::All);
        assert!(config.network_recovery);
        assert_eq!(config.throttle, ThrottleConfig::ByProgressIncrease);
        assert_eq!(config.max_concurrent_batches, 1);
        assert!(config.state_dir.to_string_lossy().contains("lite-dl"));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .with_connection_type(ConnectionType::UnmeteredOnly)
            .with_network_recovery(false)
            .with_throttle(ThrottleConfig::ByTime { interval_ms: 500 })
            .with_max_concurrent_batches(0)
            .with_file_storage(FileStorage::Internal)
            .with_state_dir("/tmp/state");

        assert_eq!(config.connection_type, ConnectionType::UnmeteredOnly);
        assert!(!config.network_recovery);
        assert_eq!(config.max_concurrent_batches, 1);
        assert_eq!(config.storage_root(), PathBuf::from("/tmp/state/files"));
        assert_eq!(config.batches_dir(), PathBuf::from("/tmp/state/batches"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = EngineConfig::new()
            .with_throttle(ThrottleConfig::ByTime { interval_ms: 250 })
            .with_download_dir(dir.path());

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "connection_type = \"unmetered_only\"\n[throttle]\nstrategy = \"by_time\"\ninterval_ms = 1000\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.connection_type, ConnectionType::UnmeteredOnly);
        assert_eq!(config.throttle, ThrottleConfig::ByTime { interval_ms: 1000 });
        assert!(config.network_recovery);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent_batches = 0\n").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let result = EngineConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
