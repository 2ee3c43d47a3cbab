//! Configuration for changelogs and the flush dispatcher
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChangelogError, Result};

/// Main configuration shared by changelogs, the dispatcher and the store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding changelog segments when used through the store.
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── 000000000.log        (data file)
    ///     ├── 000000000.log.index  (sparse index)
    ///     └── ...
    pub data_dir: PathBuf,

    /// Bytes of records between two consecutive index entries
    pub index_block_size: u64,

    /// Whether flushes actually fsync (only disabled in tests)
    pub enable_sync: bool,

    // -------------------------------------------------------------------------
    // Dispatcher Configuration
    // -------------------------------------------------------------------------
    /// Max age of unflushed records before the dispatcher flushes them
    pub flush_period: Duration,

    /// Unflushed payload bytes that trigger an immediate flush
    pub flush_buffer_size: usize,

    /// Max sleep of the flush thread between two passes
    pub flush_quantum: Duration,

    // -------------------------------------------------------------------------
    // Store Configuration
    // -------------------------------------------------------------------------
    /// Open changelogs a store keeps cached; idle ones beyond this are closed
    pub max_cached_changelogs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./changelogs"),
            index_block_size: 1024 * 1024,      // 1 MB
            enable_sync: true,
            flush_period: Duration::from_millis(10),
            flush_buffer_size: 16 * 1024 * 1024, // 16 MB
            flush_quantum: Duration::from_millis(10),
            max_cached_changelogs: 256,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject values that would stall the dispatcher or the index
    pub fn validate(&self) -> Result<()> {
        if self.index_block_size == 0 {
            return Err(ChangelogError::Config(
                "index_block_size must be positive".to_string(),
            ));
        }
        if self.flush_quantum.is_zero() {
            return Err(ChangelogError::Config(
                "flush_quantum must be positive".to_string(),
            ));
        }
        if self.max_cached_changelogs == 0 {
            return Err(ChangelogError::Config(
                "max_cached_changelogs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the directory holding changelog segments
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the byte distance between index entries
    pub fn index_block_size(mut self, size: u64) -> Self {
        self.config.index_block_size = size;
        self
    }

    /// Enable or disable fsync on flush
    pub fn enable_sync(mut self, enable: bool) -> Self {
        self.config.enable_sync = enable;
        self
    }

    /// Set the max age of unflushed records
    pub fn flush_period(mut self, period: Duration) -> Self {
        self.config.flush_period = period;
        self
    }

    /// Set the unflushed byte threshold
    pub fn flush_buffer_size(mut self, size: usize) -> Self {
        self.config.flush_buffer_size = size;
        self
    }

    /// Set the flush thread wakeup interval
    pub fn flush_quantum(mut self, quantum: Duration) -> Self {
        self.config.flush_quantum = quantum;
        self
    }

    /// Set how many changelogs a store keeps open
    pub fn max_cached_changelogs(mut self, count: usize) -> Self {
        self.config.max_cached_changelogs = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
