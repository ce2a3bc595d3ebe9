//! Configuration for AnvilDB
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::concurrency::default_threads;
use crate::error::{AnvilError, Result};
use crate::region::{Compression, DEFAULT_OVERSIZE_THRESHOLD_SECTORS, MAX_ENTRY_SECTORS};
use crate::report::{ErrorSink, TracingSink};

/// Main configuration for a LevelStorage instance
#[derive(Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the region files and oversize entries:
    ///   {data_dir}/
    ///     ├── r.<rx>.<rz>.mca   (region files)
    ///     └── c.<x>.<z>.mcc     (oversize entries)
    pub data_dir: PathBuf,

    /// Compression applied to newly written chunks
    pub compression: Compression,

    /// Frames of this many sectors or more are stored externally
    pub oversize_threshold_sectors: u32,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Maximum number of open region files
    pub region_cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Execution Configuration
    // -------------------------------------------------------------------------
    /// Worker threads for chunk I/O and compression
    pub worker_threads: usize,

    /// Worker or header-flush queue depth above which a degradation
    /// warning is reported
    pub queue_depth_warning: usize,

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------
    /// Receiver of categorized warnings and errors
    pub error_sink: Arc<dyn ErrorSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./anvildb_data"),
            compression: Compression::Deflate,
            oversize_threshold_sectors: DEFAULT_OVERSIZE_THRESHOLD_SECTORS,
            region_cache_capacity: 256,
            worker_threads: default_threads(),
            queue_depth_warning: 4096,
            error_sink: Arc::new(TracingSink),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the values can run an engine
    pub fn validate(&self) -> Result<()> {
        if self.region_cache_capacity == 0 {
            return Err(AnvilError::Config(
                "region cache capacity must be at least 1".to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(AnvilError::Config(
                "worker thread count must be at least 1".to_string(),
            ));
        }
        let max_threshold = MAX_ENTRY_SECTORS as u32 + 1;
        if self.oversize_threshold_sectors == 0 || self.oversize_threshold_sectors > max_threshold {
            return Err(AnvilError::Config(format!(
                "oversize threshold must be within 1..={} sectors, got {}",
                max_threshold, self.oversize_threshold_sectors
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("compression", &self.compression)
            .field("oversize_threshold_sectors", &self.oversize_threshold_sectors)
            .field("region_cache_capacity", &self.region_cache_capacity)
            .field("worker_threads", &self.worker_threads)
            .field("queue_depth_warning", &self.queue_depth_warning)
            .finish_non_exhaustive()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the compression used for new writes
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the oversize threshold (in sectors)
    pub fn oversize_threshold_sectors(mut self, sectors: u32) -> Self {
        self.config.oversize_threshold_sectors = sectors;
        self
    }

    /// Set the maximum number of open region files
    pub fn region_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.region_cache_capacity = capacity;
        self
    }

    /// Set the number of worker threads
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Set the queue depth that triggers a degradation warning
    pub fn queue_depth_warning(mut self, depth: usize) -> Self {
        self.config.queue_depth_warning = depth;
        self
    }

    /// Set the error sink
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.config.error_sink = sink;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
