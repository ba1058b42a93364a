use clap::Parser;
use std::path::PathBuf;

/// Webperf Coordinator: job queueing, tester tracking and result
/// aggregation backend for a distributed web-performance testing platform.
#[derive(Parser, Debug, Clone)]
#[command(name = "webperf-coordinator")]
pub struct CliArgs {
    /// Base data directory (holds settings/, tmp/, work/, results/, dat/)
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: PathBuf,

    /// Coordinator HTTP port
    #[arg(long = "port", default_value_t = DEFAULT_COORDINATOR_PORT)]
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub data_dir: PathBuf,
    pub port: u16,
}

// Port constants
pub const DEFAULT_COORDINATOR_PORT: u16 = 8090;

// Queue constants
pub const PRIORITY_LEVELS: usize = 10;
pub const LOCATION_LOCK_SECS: u64 = 30;

// Lock constants
pub const DEFAULT_LOCK_SECS: u64 = 300;
pub const LOCK_POLL_MIN_MS: u64 = 100;
pub const LOCK_POLL_MAX_MS: u64 = 150;

// Cache TTLs (seconds)
pub const SETTINGS_CACHE_SECS: u64 = 60;
pub const LOCATION_CACHE_SECS: u64 = 120;
pub const FALLBACK_CACHE_SECS: u64 = 60;
pub const TESTER_CACHE_SECS: u64 = 60;
pub const SCHEDULER_QUEUE_CACHE_SECS: u64 = 15;
pub const SCHEDULER_STATUS_CACHE_SECS: u64 = 15;

// Tester constants
pub const MAX_TESTER_MINUTES_DEFAULT: i64 = 60;
pub const MAX_TESTER_MINUTES_MIN: i64 = 5;
pub const MAX_TESTER_MINUTES_MAX: i64 = 120;
pub const TESTER_SAMPLE_CAP: usize = 100;
pub const LOCATION_OFFLINE_MINUTES: i64 = 60;

// Page-data constants
pub const PAGE_DATA_CACHE_VERSION: u32 = 10;
pub const SANE_MS_MAX: f64 = 3_600_000.0;
pub const RESULT_TEST_ERROR: i64 = 99995;

// Remote HTTP constants
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const HTTP_TOTAL_TIMEOUT_SECS: u64 = 600;

impl CoordinatorConfig {
    pub fn from_args(args: CliArgs) -> Self {
        CoordinatorConfig {
            data_dir: args.data_dir,
            port: args.port,
        }
    }

    /// Directory for lock files, queue snapshots and tester records.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Directory for per-location job files.
    pub fn work_jobs_dir(&self) -> PathBuf {
        self.data_dir.join("work").join("jobs")
    }

    /// Work directory for one location's queue.
    pub fn work_dir_for(&self, location: &str) -> PathBuf {
        self.work_jobs_dir().join(location)
    }

    /// Directory for small persistent counters (test numbers).
    pub fn dat_dir(&self) -> PathBuf {
        self.data_dir.join("dat")
    }

    /// Layered settings directory.
    pub fn settings_dir(&self) -> PathBuf {
        self.data_dir.join("settings")
    }

    /// Root of the per-test result storage.
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(DEFAULT_COORDINATOR_PORT, 8090);
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(PRIORITY_LEVELS, 10);
    }

    #[test]
    fn test_config_paths() {
        let config = CoordinatorConfig {
            data_dir: PathBuf::from("/srv/wpt"),
            port: DEFAULT_COORDINATOR_PORT,
        };
        assert_eq!(config.tmp_dir(), PathBuf::from("/srv/wpt/tmp"));
        assert_eq!(
            config.work_dir_for("Dulles_Chrome"),
            PathBuf::from("/srv/wpt/work/jobs/Dulles_Chrome")
        );
        assert_eq!(config.settings_dir(), PathBuf::from("/srv/wpt/settings"));
    }
}
