//! Per-run result file layout.
//!
//! Every run of a test leaves a family of side files in the test directory,
//! prefixed `<run>_` (plus `Cached_` for repeat view). All of them are read
//! through the gz-or-plain store.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunPaths {
    test_path: PathBuf,
    run: u32,
    cached: bool,
}

impl RunPaths {
    pub fn new(test_path: &Path, run: u32, cached: bool) -> Self {
        Self {
            test_path: test_path.to_path_buf(),
            run,
            cached,
        }
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    pub fn cached(&self) -> bool {
        self.cached
    }

    fn base(&self, name: &str) -> PathBuf {
        let cached = if self.cached { "Cached_" } else { "" };
        self.test_path.join(format!("{}_{cached}{name}", self.run))
    }

    /// Legacy tab-delimited page metrics log.
    pub fn page_data_file(&self) -> PathBuf {
        self.base("IEWPG.txt")
    }

    /// Versioned parsed-result cache.
    pub fn page_data_cache_file(&self, version: u32) -> PathBuf {
        self.base(&format!("page_data_{version}.json"))
    }

    /// Authoritative agent-reported metrics.
    pub fn page_data_json_file(&self) -> PathBuf {
        self.base("page_data.json")
    }

    pub fn user_timed_events_file(&self) -> PathBuf {
        self.base("timed_events.json")
    }

    pub fn custom_metrics_file(&self) -> PathBuf {
        self.base("metrics.json")
    }

    pub fn interactive_file(&self) -> PathBuf {
        self.base("interactive.json")
    }

    pub fn long_tasks_file(&self) -> PathBuf {
        self.base("long_tasks.json")
    }

    pub fn test_timing_file(&self) -> PathBuf {
        self.base("test_timing.txt")
    }

    pub fn video_dir(&self) -> PathBuf {
        let cached = if self.cached { "_cached" } else { "" };
        self.test_path.join(format!("video_{}{cached}", self.run))
    }

    pub fn visual_progress_file(&self) -> PathBuf {
        self.base("visual_progress.json")
    }

    /// Per-thread CPU busy-time slices from the trace.
    pub fn cpu_slices_file(&self) -> PathBuf {
        self.base("timeline_cpu.json")
    }

    /// Chrome trace user-timing events.
    pub fn chrome_user_timing_file(&self) -> PathBuf {
        self.base("user_timing.json")
    }

    pub fn feature_usage_file(&self) -> PathBuf {
        self.base("feature_usage.json")
    }

    pub fn priority_streams_file(&self) -> PathBuf {
        self.base("priority_streams.json")
    }

    pub fn requests_file(&self) -> PathBuf {
        self.base("requests.json")
    }

    pub fn requests_analysis_file(&self) -> PathBuf {
        self.base("requests_analysis.json")
    }

    pub fn crux_json_file(&self) -> PathBuf {
        self.base("crux.json")
    }

    /// Lighthouse results are test-level, not per-run.
    pub fn lighthouse_audits_file(&self) -> PathBuf {
        self.test_path.join("lighthouse_audits.json")
    }

    pub fn lighthouse_json_file(&self) -> PathBuf {
        self.test_path.join("lighthouse.json")
    }
}
