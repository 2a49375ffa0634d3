//! Configuration types for runtime and execution settings

use std::time::Duration;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of file streams open at once (None = unlimited)
    pub max_open_streams: Option<usize>,
    /// Directory entries visited per second (0 = no throttle)
    pub ops_throttle: usize,
    /// Chunk-sized I/O operations per second (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size for I/O operations (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        if self.max_open_streams == Some(0) {
            return Err("max_open_streams must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Connection pool limits
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum number of live sessions across all connection keys
    pub max_connections: usize,
    /// How long `acquire` waits for a free slot before giving up
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Defaults for directory archive downloads
#[derive(Debug, Clone, Copy)]
pub struct ArchiveConfig {
    /// Upper bound on the summed size of archived files
    pub max_total_bytes: u64,
    /// Buffer between the archive builder and the consumer
    pub buffer_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 4 * 1024 * 1024 * 1024,
            buffer_size: 64 * 1024,
        }
    }
}

/// Scan job limits
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    /// Scans allowed to run at the same time; the rest stay queued
    pub max_concurrent: usize,
    /// Jobs (queued or running) the registry accepts before refusing new ones
    pub queue_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_capacity: 1000,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent scans must be greater than zero".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("scan queue capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Converts a signed depth setting into a limit: negative means unlimited.
#[must_use]
pub fn depth_limit(max_depth: i32) -> Option<u32> {
    u32::try_from(max_depth).ok()
}
