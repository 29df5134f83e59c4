use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TabsplitError};

/// Top-level configuration for a Tabsplit installation.
///
/// Loaded from `~/.tabsplit/config.toml` by default. User-facing preferences
/// (currency, retention policy, ...) live in the persisted `Settings`
/// record instead; this file only covers process-level concerns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabsplitConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl TabsplitConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TabsplitConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TabsplitError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Full path of the database file under the configured data directory.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.general.data_dir).join(&self.storage.database_file)
    }
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the database file. `~/` is expanded.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.tabsplit/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name inside `general.data_dir`.
    pub database_file: String,
    /// Hard size limit of the database in KiB. 0 disables the quota.
    pub quota_kb: u64,
    /// Fraction of the quota at which a quota warning is emitted.
    pub quota_warning_ratio: f64,
    /// How long a transaction waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Buffer size of the broadcast channel behind `subscribe_all`.
    pub event_channel_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: "tabsplit.db".to_string(),
            quota_kb: 0,
            quota_warning_ratio: 0.9,
            busy_timeout_ms: 5_000,
            event_channel_capacity: 256,
        }
    }
}

impl StorageConfig {
    /// Quota in bytes, if one is configured.
    pub fn quota_bytes(&self) -> Option<u64> {
        if self.quota_kb == 0 {
            None
        } else {
            Some(self.quota_kb.saturating_mul(1024))
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}
