//! Cross-process named locks backed by lock files under `tmp/`.
//!
//! A lock is held by exclusively creating its file; release deletes it. Locks
//! left behind by a crashed process go stale once their mtime exceeds the
//! caller's max age and are broken by the next acquirer. Every held lock is
//! tracked in a process-wide registry so shutdown can release anything a
//! panicked task failed to drop.

use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use crate::config::{LOCK_POLL_MAX_MS, LOCK_POLL_MIN_MS};

fn held_locks() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

fn lock_path(tmp_dir: &Path, name: &str) -> PathBuf {
    let safe = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' ' | '.'));
    if safe && !name.is_empty() {
        tmp_dir.join(format!("named-{}.lock", name.replace(' ', "_")))
    } else {
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        tmp_dir.join(format!("lock-{}.lock", hex::encode(hasher.finalize())))
    }
}

/// RAII handle for a held named lock. Dropping it releases the lock.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        release(&self.path);
    }
}

fn release(path: &Path) {
    let _ = std::fs::remove_file(path);
    if let Ok(mut held) = held_locks().lock() {
        held.remove(path);
    }
}

fn try_acquire(path: &Path, max_age: Duration) -> bool {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => {
            if let Ok(mut held) = held_locks().lock() {
                held.insert(path.to_path_buf());
            }
            true
        }
        Err(_) => {
            // Break the lock if the holder looks dead.
            if let Ok(meta) = std::fs::metadata(path) {
                if let Ok(mtime) = meta.modified() {
                    let age = SystemTime::now()
                        .duration_since(mtime)
                        .unwrap_or_default();
                    if age > max_age {
                        tracing::warn!(path = %path.display(), "breaking stale lock");
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
            false
        }
    }
}

/// Acquire a named lock, polling until `timeout` elapses.
///
/// `max_age` is how old the lock file may get before it is considered
/// abandoned and forcibly broken.
pub async fn acquire(
    tmp_dir: &Path,
    name: &str,
    timeout: Duration,
    max_age: Duration,
) -> Option<LockGuard> {
    std::fs::create_dir_all(tmp_dir).ok()?;
    let path = lock_path(tmp_dir, name);
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if try_acquire(&path, max_age) {
            return Some(LockGuard { path });
        }
        if std::time::Instant::now() >= deadline {
            return None;
        }
        let jitter = rand::thread_rng().gen_range(LOCK_POLL_MIN_MS..=LOCK_POLL_MAX_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

/// Non-blocking acquire; returns None immediately if the lock is held.
pub fn try_lock(tmp_dir: &Path, name: &str, max_age: Duration) -> Option<LockGuard> {
    std::fs::create_dir_all(tmp_dir).ok()?;
    let path = lock_path(tmp_dir, name);
    if try_acquire(&path, max_age) {
        Some(LockGuard { path })
    } else {
        None
    }
}

/// Release every lock this process still holds. Called on shutdown.
pub fn release_remaining() {
    let paths: Vec<PathBuf> = match held_locks().lock() {
        Ok(held) => held.iter().cloned().collect(),
        Err(_) => return,
    };
    for path in paths {
        tracing::debug!(path = %path.display(), "releasing lock at shutdown");
        release(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_safe_and_hashed_names() {
        let tmp = Path::new("/tmp/x");
        let safe = lock_path(tmp, "Unique ID");
        assert_eq!(safe, Path::new("/tmp/x/named-Unique_ID.lock"));
        let hashed = lock_path(tmp, "loc/with/slashes");
        assert!(hashed
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("lock-"));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let guard = acquire(
            dir.path(),
            "t1",
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let path = dir.path().join("named-t1.lock");
        assert!(path.is_file());
        drop(guard);
        assert!(!path.is_file());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = acquire(
            dir.path(),
            "t2",
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let second = acquire(
            dir.path(),
            "t2",
            Duration::from_millis(200),
            Duration::from_secs(30),
        )
        .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("named-t3.lock");
        std::fs::write(&path, "").unwrap();
        // Zero max age makes the existing file immediately stale.
        let guard = acquire(
            dir.path(),
            "t3",
            Duration::from_secs(2),
            Duration::ZERO,
        )
        .await;
        assert!(guard.is_some());
    }

    #[test]
    fn test_try_lock_is_non_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let first = try_lock(dir.path(), "t4", Duration::from_secs(30));
        assert!(first.is_some());
        let second = try_lock(dir.path(), "t4", Duration::from_secs(30));
        assert!(second.is_none());
    }
}
