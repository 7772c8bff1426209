//! Configuration types for runtime, output and daemon settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=WARN, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Where log events go besides stderr
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Append all log events to this file as well
    pub log_file: Option<std::path::PathBuf>,
}

/// Timing and sizing knobs of the scan-and-dispatch loop
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How often every directory is checked for new files
    pub check_interval: std::time::Duration,
    /// How often rule files are checked for modification
    pub reread_interval: std::time::Duration,
    /// How often finished workers are reaped and old files swept
    pub sweep_interval: std::time::Duration,
    /// Upper bound of one full pass over all directories
    pub full_scan_timeout: std::time::Duration,
    /// Upper bound spent on a single directory within one pass
    pub one_dir_copy_timeout: std::time::Duration,
    /// Files per chunk; directories holding more are handed to a worker
    pub max_copied_files: usize,
    /// Bytes per chunk; directories holding more are handed to a worker
    pub max_copied_size: u64,
    /// Global bound on live worker tasks
    pub max_workers: usize,
    /// Consecutive errors before a directory is flagged
    pub max_errors: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            check_interval: std::time::Duration::from_secs(5),
            reread_interval: std::time::Duration::from_secs(10),
            sweep_interval: std::time::Duration::from_secs(3600),
            full_scan_timeout: std::time::Duration::from_secs(30),
            one_dir_copy_timeout: std::time::Duration::from_secs(10),
            max_copied_files: 100,
            max_copied_size: 100 * 1024 * 1024,
            max_workers: 10,
            max_errors: 10,
        }
    }
}

impl ScanConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval.is_zero() {
            return Err("check interval must be greater than zero".to_string());
        }
        if self.max_copied_files == 0 {
            return Err("max copied files must be at least 1".to_string());
        }
        if self.one_dir_copy_timeout > self.full_scan_timeout {
            return Err(format!(
                "one directory timeout ({:?}) must not exceed the full scan timeout ({:?})",
                self.one_dir_copy_timeout, self.full_scan_timeout
            ));
        }
        Ok(())
    }
}

/// Knobs of the rule file compiler
#[derive(Debug, Clone)]
pub struct CompileSettings {
    /// Priority given to jobs that do not set one
    pub default_priority: u8,
    /// Create local source directories that do not exist yet
    pub create_source_dir: bool,
    /// Mode for directories created by the compiler
    pub source_dir_mode: u32,
    /// Drop hosts that no recipient references anymore
    pub remove_unused_hosts: bool,
    /// Default for the `max process` directory option
    pub default_max_process: usize,
    /// Default age (seconds) after which unknown files are deleted, 0 disables
    pub default_delete_unknown: u64,
    /// Default for the `warn time` directory option, 0 disables
    pub default_warn_time: u64,
    /// Where spool directories of remote sources live
    pub spool_root: std::path::PathBuf,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            default_priority: 9,
            create_source_dir: true,
            source_dir_mode: 0o755,
            remove_unused_hosts: false,
            default_max_process: 3,
            default_delete_unknown: 0,
            default_warn_time: 0,
            spool_root: std::path::PathBuf::from("spool"),
        }
    }
}
