//! Typed configuration and the store that persists it.
//!
//! The session controller only ever consumes a [`SyncConfig`] value; where it
//! lives on disk is the business of a [`ConfigStore`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Name of the folder created on the chosen drive to hold mirrored files
pub const DEFAULT_BACKUP_FOLDER: &str = "Tether_Backups";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub ignore: IgnoreConfig,
    pub watcher: WatcherConfig,
    pub drives: DriveConfig,
    pub backup: BackupConfig,
}

/// User-configurable exclusions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Lowercase extensions without a leading dot
    pub ignored_extensions: BTreeSet<String>,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self::with_extensions(["db", "ldb", "ini", "dat"])
    }
}

impl IgnoreConfig {
    /// An empty configuration that ignores no extensions
    pub fn empty() -> Self {
        Self {
            ignored_extensions: BTreeSet::new(),
        }
    }

    /// Build from raw extension strings; invalid entries are dropped
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ignored_extensions = extensions
            .into_iter()
            .filter_map(|ext| normalize_extension(ext.as_ref()))
            .collect();
        Self { ignored_extensions }
    }

    /// Returns `true` if the extension was newly added
    pub fn add_extension(&mut self, extension: &str) -> Result<bool> {
        let ext = normalize_extension(extension).ok_or_else(|| {
            Error::configuration(format!("'{}' is not a valid file extension", extension))
        })?;
        Ok(self.ignored_extensions.insert(ext))
    }

    /// Returns `true` if the extension was present
    pub fn remove_extension(&mut self, extension: &str) -> bool {
        match normalize_extension(extension) {
            Some(ext) => self.ignored_extensions.remove(&ext),
            None => false,
        }
    }

    /// Case-insensitive membership test; `ext` may carry a leading dot
    pub fn contains(&self, ext: &str) -> bool {
        normalize_extension(ext)
            .map(|ext| self.ignored_extensions.contains(&ext))
            .unwrap_or(false)
    }

    /// Re-normalize entries, e.g. after deserializing a hand-edited file
    pub fn normalized(self) -> Self {
        Self::with_extensions(self.ignored_extensions)
    }
}

/// Lowercase, strip leading dots and whitespace. Rejects empty strings and
/// anything containing a path separator.
pub fn normalize_extension(raw: &str) -> Option<String> {
    let ext = raw.trim().trim_start_matches('.').to_lowercase();
    if ext.is_empty() || ext.contains(['/', '\\']) || ext.chars().any(char::is_whitespace) {
        None
    } else {
        Some(ext)
    }
}

/// Debounce tuning for the change watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Quiet period after the last event before a batch flushes
    pub debounce_ms: u64,
    /// Upper bound on how long the first pending event may be held
    pub max_hold_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_hold_ms: 5_000,
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(1))
    }

    /// Never shorter than the debounce window
    pub fn max_hold(&self) -> Duration {
        Duration::from_millis(self.max_hold_ms).max(self.debounce())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub poll_interval_secs: u64,
    /// Network mounts are excluded unless this is set
    pub include_network: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            include_network: false,
        }
    }
}

impl DriveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Folder created under the chosen drive; the real backup target
    pub folder_name: String,
    pub max_parallel_copies: usize,
    /// How often a deferred batch is retried while the destination is missing
    pub retry_interval_secs: u64,
    /// Mirror the whole watch root when a session starts
    pub initial_sync: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            folder_name: DEFAULT_BACKUP_FOLDER.to_string(),
            max_parallel_copies: 4,
            retry_interval_secs: 5,
            initial_sync: false,
        }
    }
}

impl BackupConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    /// Resolve the backup target for a user-chosen drive or folder
    pub fn backup_target_for(&self, chosen: &Path) -> PathBuf {
        if self.folder_name.is_empty() {
            chosen.to_path_buf()
        } else {
            chosen.join(&self.folder_name)
        }
    }
}

/// External persistence for [`SyncConfig`]
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<SyncConfig>;
    fn save(&self, config: &SyncConfig) -> Result<()>;
}

/// TOML file store, by default under the platform config directory
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config_dir>/tether/config.toml`
    pub fn default_location() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::configuration("Could not determine config directory"))?;
        Ok(Self::new(config_dir.join("tether").join("config.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    /// Loads the file, writing defaults first if it does not exist yet
    fn load(&self) -> Result<SyncConfig> {
        if self.path.exists() {
            debug!("Loading config from {}", self.path.display());
            let content = fs::read_to_string(&self.path)?;
            let mut config: SyncConfig = toml::from_str(&content)?;
            config.ignore = config.ignore.normalized();
            Ok(config)
        } else {
            debug!("Config file not found, creating default at {}", self.path.display());
            let config = SyncConfig::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    fn save(&self, config: &SyncConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        // Write beside the target then rename so a crash never leaves half a file
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Config saved to {}", self.path.display());
        Ok(())
    }
}

/// Keeps the configuration in memory only
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<SyncConfig>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    /// Number of times `save` has been called
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<SyncConfig> {
        Ok(self
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, config: &SyncConfig) -> Result<()> {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config.clone();
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
