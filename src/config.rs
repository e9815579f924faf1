//! Configuration management for layerfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default attribute/entry cache timeout handed to the kernel: 1s
pub const DEFAULT_ATTR_TTL_MS: u64 = 1000;

/// Synthetic statfs block size reported for in-memory entries
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Synthetic statfs block count reported for in-memory entries
pub const DEFAULT_BLOCKS: u64 = 4096;

/// Synthetic statfs available blocks reported for in-memory entries
pub const DEFAULT_BLOCKS_AVAILABLE: u64 = 2048;

/// Largest in-memory file: 64 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// In-memory layer configuration
    pub memory: MemoryConfig,

    /// Directory listing configuration
    pub listing: ListingConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Attribute and entry cache timeout in milliseconds
    pub attr_ttl_ms: u64,
}

/// In-memory layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Permission bits of the in-memory root entry
    pub root_mode: u32,

    /// statfs block size for in-memory entries
    pub block_size: u32,

    /// statfs total blocks for in-memory entries
    pub blocks: u64,

    /// statfs available blocks for in-memory entries
    pub blocks_available: u64,

    /// Largest size an in-memory file may grow to, in bytes
    pub max_file_size: u64,
}

/// Directory listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Drop repeated names across layers (primary > fallback > in-memory)
    pub deduplicate: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_name: "layerfs".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl_ms: DEFAULT_ATTR_TTL_MS,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            root_mode: 0o755,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks: DEFAULT_BLOCKS,
            blocks_available: DEFAULT_BLOCKS_AVAILABLE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        ListingConfig { deduplicate: true }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for mounts without a config file
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("LAYERFS_ALLOW_OTHER") {
            if let Some(flag) = parse_flag(&value) {
                self.mount.allow_other = flag;
            }
        }

        if let Ok(value) = std::env::var("LAYERFS_ATTR_TTL_MS") {
            if let Ok(ttl) = value.trim().parse::<u64>() {
                self.mount.attr_ttl_ms = ttl;
            }
        }

        if let Ok(value) = std::env::var("LAYERFS_DEDUPLICATE") {
            if let Some(flag) = parse_flag(&value) {
                self.listing.deduplicate = flag;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.fs_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        if self.memory.block_size == 0 {
            return Err(Error::InvalidConfig(
                "Block size must be greater than 0".to_string(),
            ));
        }

        if self.memory.blocks_available > self.memory.blocks {
            return Err(Error::InvalidConfig(
                "Available blocks exceed total blocks".to_string(),
            ));
        }

        if self.memory.max_file_size == 0 {
            return Err(Error::InvalidConfig(
                "Maximum in-memory file size must be greater than 0".to_string(),
            ));
        }

        if self.memory.root_mode & !0o7777 != 0 {
            return Err(Error::InvalidConfig(format!(
                "Root mode {:o} carries more than permission bits",
                self.memory.root_mode
            )));
        }

        Ok(())
    }

    /// Kernel attribute cache timeout
    pub fn attr_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.mount.attr_ttl_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.listing.deduplicate);
        assert_eq!(config.memory.block_size, 512);
        assert_eq!(config.attr_ttl(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_validation_rejects_bad_statfs() {
        let mut config = Config::default();
        config.memory.blocks_available = config.memory.blocks + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.memory.block_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.root_mode = 0o40755;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.max_file_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layerfs.json");

        std::fs::write(&path, r#"{ "mount": { "fs_name": "unionized" } }"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.mount.fs_name, "unionized");
        assert_eq!(config.memory.blocks, DEFAULT_BLOCKS);

        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.mount.fs_name, "unionized");
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
