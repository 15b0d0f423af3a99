//! Storage configuration
//!
//! Loaded from a TOML file with two sections:
//!
//! ```toml
//! [wal]
//! mode = "log_only"
//! segment_size = 67108864
//! compaction_enabled = false
//! compaction_level = 1
//! max_archive_size = 1073741824
//! history_size = 20
//! rebalance_max_segments = 0
//! rebalance_max_missing_updates = 0
//!
//! [archiver]
//! interval_ms = 1000
//! ```
//!
//! A missing file yields the defaults. Values are validated on load.

use crate::error::{Result, WalError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durability mode of the WAL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalMode {
    /// fsync after every append
    Full,
    /// Flush to the OS after every append
    #[default]
    LogOnly,
    /// Leave flushing to segment rollover
    Background,
    /// No WAL at all; the retention subsystem is inert
    None,
}

impl WalMode {
    pub fn is_enabled(self) -> bool {
        self != WalMode::None
    }
}

impl std::fmt::Display for WalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalMode::Full => write!(f, "full"),
            WalMode::LogOnly => write!(f, "log_only"),
            WalMode::Background => write!(f, "background"),
            WalMode::None => write!(f, "none"),
        }
    }
}

/// `[wal]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub mode: WalMode,
    /// Bytes after which the active segment counts as full (default: 64MB)
    pub segment_size: u64,
    /// Compress archived segments with zstd
    pub compaction_enabled: bool,
    /// zstd level used for archived segments
    pub compaction_level: i32,
    /// Archive size that forces checkpoint history eviction (0 = unlimited)
    pub max_archive_size: u64,
    /// Number of checkpoint records kept for historical rebalance
    pub history_size: usize,
    /// Most WAL segments a historical rebalance may stream (0 = unlimited)
    pub rebalance_max_segments: u64,
    /// Most missing updates a historical rebalance may replay (0 = unlimited)
    pub rebalance_max_missing_updates: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            mode: WalMode::LogOnly,
            segment_size: 64 * 1024 * 1024,
            compaction_enabled: false,
            compaction_level: 1,
            max_archive_size: 1024 * 1024 * 1024,
            history_size: 20,
            rebalance_max_segments: 0,
            rebalance_max_missing_updates: 0,
        }
    }
}

/// `[archiver]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    /// Delay between background passes
    pub interval_ms: u64,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Complete storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub archiver: ArchiverConfig,
}

impl StorageConfig {
    /// Load configuration from a TOML file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(contents)
            .map_err(|e| WalError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let contents = toml::to_string_pretty(self)
            .map_err(|e| WalError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every value against its valid range
    pub fn validate(&self) -> Result<()> {
        let wal = &self.wal;

        if !(1024u64..=2 * 1024 * 1024 * 1024).contains(&wal.segment_size) {
            return Err(WalError::Config(format!(
                "wal.segment_size must be between 1KB and 2GB, got {}",
                wal.segment_size
            )));
        }
        if !(1i32..=22).contains(&wal.compaction_level) {
            return Err(WalError::Config(format!(
                "wal.compaction_level must be between 1 and 22, got {}",
                wal.compaction_level
            )));
        }
        if wal.max_archive_size != 0 && wal.max_archive_size < wal.segment_size {
            return Err(WalError::Config(format!(
                "wal.max_archive_size ({}) must be 0 or at least one segment ({})",
                wal.max_archive_size, wal.segment_size
            )));
        }
        if !(1usize..=100_000).contains(&wal.history_size) {
            return Err(WalError::Config(format!(
                "wal.history_size must be between 1 and 100,000, got {}",
                wal.history_size
            )));
        }
        if !(10u64..=3_600_000).contains(&self.archiver.interval_ms) {
            return Err(WalError::Config(format!(
                "archiver.interval_ms must be between 10 and 3,600,000, got {}",
                self.archiver.interval_ms
            )));
        }

        Ok(())
    }

    /// Commented example configuration
    pub fn example_config() -> &'static str {
        r#"# Walkeep storage configuration

[wal]
# full | log_only | background | none
mode = "log_only"
# Segment rollover size in bytes (1KB - 2GB)
segment_size = 67108864
# Compress archived segments with zstd
compaction_enabled = false
compaction_level = 1
# Archive size that forces history eviction, 0 = unlimited
max_archive_size = 1073741824
# Checkpoints kept for historical rebalance (1 - 100,000)
history_size = 20
# Fall back to full rebalance above these limits, 0 = unlimited
rebalance_max_segments = 0
rebalance_max_missing_updates = 0

[archiver]
# Delay between archiver passes (10 - 3,600,000 ms)
interval_ms = 1000
"#
    }
}
