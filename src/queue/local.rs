//! File-backed priority job queue.
//!
//! Each location has a work directory of job files plus a gzip JSON snapshot
//! (`tmp/<sha1(work_dir)>.queue`) of ten priority buckets. The snapshot is
//! authoritative for ordering; when it is missing or holds only
//! tester-affinity leftovers it is rebuilt from a sorted directory scan, which
//! recovers FIFO order because job file names start with a sortable
//! date+sequence prefix.

use crate::config::{CoordinatorConfig, LOCATION_LOCK_SECS, PRIORITY_LEVELS};
use crate::gzio;
use crate::lock;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

pub type QueueBuckets = Vec<Vec<String>>;

pub struct DequeuedJob {
    pub file: String,
    pub priority: usize,
    pub payload: String,
}

fn empty_buckets() -> QueueBuckets {
    vec![Vec::new(); PRIORITY_LEVELS]
}

fn snapshot_path(config: &CoordinatorConfig, work_dir: &Path) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(work_dir.to_string_lossy().as_bytes());
    config
        .tmp_dir()
        .join(format!("{}.queue", hex::encode(hasher.finalize())))
}

/// Job file name: sortable date+sequence prefix, optional affinity tag, test
/// ID and a priority extension (`url` is priority 0).
pub fn job_file_name(
    sequence: u64,
    affinity: Option<&str>,
    test_id: &str,
    priority: usize,
) -> String {
    let prefix = format!(
        "{}{}",
        chrono::Utc::now().format("%y%m%d"),
        crate::testid::sortable_string(sequence, 6)
    );
    let affinity_part = affinity
        .map(|a| format!("Affinity{a}."))
        .unwrap_or_default();
    let ext = if priority == 0 {
        "url".to_string()
    } else {
        format!("p{priority}")
    };
    format!("{prefix}.{affinity_part}{test_id}.{ext}")
}

fn has_real_work(buckets: &QueueBuckets) -> bool {
    buckets
        .iter()
        .flatten()
        .any(|entry| !entry.contains("AffinityTester"))
}

fn priority_of(file: &str) -> Option<usize> {
    if file.to_ascii_lowercase().ends_with(".url") {
        return Some(0);
    }
    let (_, ext) = file.rsplit_once('.')?;
    let mut chars = ext.chars();
    if chars.next()?.to_ascii_lowercase() != 'p' {
        return None;
    }
    let digit = chars.next()?.to_digit(10)? as usize;
    if chars.next().is_none() && (1..PRIORITY_LEVELS).contains(&digit) {
        Some(digit)
    } else {
        None
    }
}

fn rebuild_from_scan(work_dir: &Path) -> QueueBuckets {
    let mut buckets = empty_buckets();
    let pattern = work_dir.join("*").to_string_lossy().into_owned();
    let mut files: Vec<String> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(|p| p.ok())
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect(),
        Err(_) => return buckets,
    };
    files.sort();
    for file in files {
        if let Some(priority) = priority_of(&file) {
            buckets[priority].push(file);
        }
    }
    buckets
}

/// Load a location's queue, rebuilding from the work directory if the
/// snapshot is missing or stale.
pub fn load_queue(config: &CoordinatorConfig, work_dir: &Path) -> QueueBuckets {
    let path = snapshot_path(config, work_dir);
    if let Some(text) = gzio::gz_read_to_string(&path) {
        if let Ok(buckets) = serde_json::from_str::<QueueBuckets>(&text) {
            if buckets.len() == PRIORITY_LEVELS && has_real_work(&buckets) {
                return buckets;
            }
        }
    }
    let buckets = rebuild_from_scan(work_dir);
    save_queue(config, work_dir, &buckets);
    buckets
}

pub fn save_queue(config: &CoordinatorConfig, work_dir: &Path, buckets: &QueueBuckets) -> bool {
    let path = snapshot_path(config, work_dir);
    match serde_json::to_vec(buckets) {
        Ok(json) => gzio::gz_write(&path, &json).is_ok(),
        Err(_) => false,
    }
}

async fn lock_location(config: &CoordinatorConfig, location: &str) -> Option<lock::LockGuard> {
    lock::acquire(
        &config.tmp_dir(),
        &format!("Location {location}"),
        Duration::from_secs(LOCATION_LOCK_SECS),
        Duration::from_secs(LOCATION_LOCK_SECS),
    )
    .await
}

/// Write a job file and append it to the priority bucket, honoring an
/// optional per-priority cap.
pub async fn enqueue(
    config: &CoordinatorConfig,
    location: &str,
    file_name: &str,
    payload: &str,
    priority: usize,
    queue_limit: u64,
) -> bool {
    if priority >= PRIORITY_LEVELS {
        return false;
    }
    let work_dir = config.work_dir_for(location);
    if std::fs::create_dir_all(&work_dir).is_err() {
        return false;
    }
    let Some(_guard) = lock_location(config, location).await else {
        return false;
    };
    let mut buckets = load_queue(config, &work_dir);
    if queue_limit > 0 && buckets[priority].len() as u64 >= queue_limit {
        tracing::warn!(location, priority, queue_limit, "queue limit reached");
        return false;
    }
    if std::fs::write(work_dir.join(file_name), payload).is_err() {
        return false;
    }
    buckets[priority].push(file_name.to_string());
    save_queue(config, &work_dir, &buckets)
}

/// Write a job file without touching the snapshot. Globally brokered queues
/// keep ordering in the per-priority tubes and only store payloads here.
pub fn write_job_file(
    config: &CoordinatorConfig,
    location: &str,
    file_name: &str,
    payload: &str,
) -> bool {
    let work_dir = config.work_dir_for(location);
    if std::fs::create_dir_all(&work_dir).is_err() {
        return false;
    }
    std::fs::write(work_dir.join(file_name), payload).is_ok()
}

/// Claim a job handed out by file name: read the payload and remove the
/// file. Vanished or empty files yield nothing.
pub fn claim_job_file(
    config: &CoordinatorConfig,
    location: &str,
    file_name: &str,
) -> Option<DequeuedJob> {
    let path = config.work_dir_for(location).join(file_name);
    let payload = std::fs::read_to_string(&path).ok()?;
    let _ = std::fs::remove_file(&path);
    if payload.is_empty() {
        return None;
    }
    Some(DequeuedJob {
        file: file_name.to_string(),
        priority: priority_of(file_name).unwrap_or(0),
        payload,
    })
}

fn affinity_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"Affinity(?P<affinity>[a-zA-Z0-9\-_]+)\.(?P<id>[a-zA-Z0-9_]+)\.(p[0-9]|url)$")
            .unwrap()
    })
}

fn tester_affinity_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^Tester(?P<tester>[a-zA-Z0-9\-_]+)$").unwrap())
}

fn affinity_matches(
    job_file: &str,
    tester: Option<&str>,
    tester_index: Option<usize>,
    tester_count: Option<usize>,
) -> bool {
    let Some(captures) = affinity_pattern().captures(job_file) else {
        // No affinity tag, any tester can take it.
        return true;
    };
    let affinity = &captures["affinity"];
    if let Some(tester_caps) = tester_affinity_pattern().captures(affinity) {
        return tester
            .map(|t| t.eq_ignore_ascii_case(&tester_caps["tester"]))
            .unwrap_or(false);
    }
    if let (Some(index), Some(count)) = (tester_index, tester_count) {
        if index < count {
            if let Ok(value) = affinity.parse::<usize>() {
                return value % count == index;
            }
        }
    }
    false
}

/// Dequeue the next eligible job, scanning priorities 0 through 9 FIFO.
///
/// Entries whose job file has vanished are dropped and the scan continues.
/// An empty payload deletes the job file and yields nothing.
pub async fn dequeue(
    config: &CoordinatorConfig,
    location: &str,
    tester: Option<&str>,
    tester_index: Option<usize>,
    tester_count: Option<usize>,
) -> Option<DequeuedJob> {
    let work_dir = config.work_dir_for(location);
    let _guard = lock_location(config, location).await?;
    let mut buckets = load_queue(config, &work_dir);
    let mut picked: Option<(String, usize)> = None;
    let mut modified = false;

    'scan: for priority in 0..PRIORITY_LEVELS {
        let mut index = 0;
        while index < buckets[priority].len() {
            let job_file = buckets[priority][index].clone();
            if affinity_matches(&job_file, tester, tester_index, tester_count) {
                buckets[priority].remove(index);
                modified = true;
                if work_dir.join(&job_file).is_file() {
                    picked = Some((job_file, priority));
                    break 'scan;
                }
                // Vanished job file; keep scanning without advancing.
                continue;
            }
            index += 1;
        }
    }

    if modified {
        save_queue(config, &work_dir, &buckets);
    }

    let (file, priority) = picked?;
    let path = work_dir.join(&file);
    match std::fs::read_to_string(&path) {
        Ok(payload) if !payload.is_empty() => {
            // The job is handed out; a leftover file would be re-queued by
            // the next directory rescan.
            let _ = std::fs::remove_file(&path);
            Some(DequeuedJob {
                file,
                priority,
                payload,
            })
        }
        _ => {
            let _ = std::fs::remove_file(&path);
            None
        }
    }
}

/// Number of jobs strictly ahead of a test in the queue, or -1 if the test
/// is not queued.
pub fn position(config: &CoordinatorConfig, location: &str, test_id: &str) -> i64 {
    let work_dir = config.work_dir_for(location);
    let buckets = load_queue(config, &work_dir);
    let needle = test_id.to_ascii_lowercase();
    let mut count: i64 = 0;
    for bucket in &buckets {
        for file in bucket {
            if file.to_ascii_lowercase().contains(&needle) {
                return count;
            }
            count += 1;
        }
    }
    -1
}

/// Per-priority queue lengths.
pub fn lengths(config: &CoordinatorConfig, location: &str) -> Vec<u64> {
    let work_dir = config.work_dir_for(location);
    load_queue(config, &work_dir)
        .iter()
        .map(|bucket| bucket.len() as u64)
        .collect()
}
