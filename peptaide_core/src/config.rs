//! Configuration file support for Peptaide.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/peptaide/config.toml`.

use crate::{Error, ProfileDefaults, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub profile: ProfileConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Per-user simulation and cycle defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Mixed into every simulation seed
    #[serde(default = "default_user_id")]
    pub user_id: String,

    #[serde(default = "default_simulation_n")]
    pub default_simulation_n: u32,

    #[serde(default = "default_cycle_gap_days")]
    pub cycle_gap_default_days: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            default_simulation_n: default_simulation_n(),
            cycle_gap_default_days: default_cycle_gap_days(),
        }
    }
}

/// Lock behaviour of the file stores
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("peptaide")
}

fn default_user_id() -> String {
    "local".into()
}

fn default_simulation_n() -> u32 {
    ProfileDefaults::default().default_simulation_n
}

fn default_cycle_gap_days() -> f64 {
    ProfileDefaults::default().cycle_gap_default_days
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.profile.default_simulation_n == 0 {
            return Err(Error::Config(
                "profile.default_simulation_n must be at least 1".into(),
            ));
        }
        let gap = self.profile.cycle_gap_default_days;
        if !gap.is_finite() || gap < 0.0 {
            return Err(Error::Config(format!(
                "profile.cycle_gap_default_days must be a non-negative number (got {})",
                gap
            )));
        }
        if self.profile.user_id.trim().is_empty() {
            return Err(Error::Config("profile.user_id must not be empty".into()));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("peptaide").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn profile_defaults(&self) -> ProfileDefaults {
        ProfileDefaults {
            default_simulation_n: self.profile.default_simulation_n,
            cycle_gap_default_days: self.profile.cycle_gap_default_days,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.lock_timeout_ms)
    }

    pub fn events_path(&self) -> PathBuf {
        self.data.data_dir.join("events.jsonl")
    }

    pub fn cycles_path(&self) -> PathBuf {
        self.data.data_dir.join("cycles.json")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data.data_dir.join("catalog.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.profile.user_id, "local");
        assert_eq!(config.profile.default_simulation_n, 2048);
        assert_eq!(config.profile.cycle_gap_default_days, 7.0);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(config.data.data_dir.ends_with("peptaide"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.profile.user_id = "alice".into();
        config.data.data_dir = temp_dir.path().join("data");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.profile.user_id, "alice");
        assert_eq!(loaded.events_path(), temp_dir.path().join("data/events.jsonl"));
        assert_eq!(loaded.cycles_path(), temp_dir.path().join("data/cycles.json"));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[profile]
cycle_gap_default_days = 10.5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let defaults = config.profile_defaults();
        assert_eq!(defaults.cycle_gap_default_days, 10.5);
        assert_eq!(defaults.default_simulation_n, 2048); // default
        assert_eq!(config.profile.user_id, "local");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[profile]\ndefault_simulation_n = 0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[profile]\ncycle_gap_default_days = -1.0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
