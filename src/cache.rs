//! In-process short-TTL cache.
//!
//! The lookups this service repeats on every poll (settings, location tables,
//! tester rosters, remote queue lengths) are cheap to recompute but hot enough
//! that re-reading them from disk or the network per request would dominate.
//! Entries are namespaced by a digest of the data directory so multiple
//! instances sharing a process (tests, mostly) do not collide.

use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct ShortTtlCache {
    entries: RwLock<HashMap<String, (Option<Instant>, Value)>>,
}

impl ShortTtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch an unexpired entry, or None if missing or past its deadline.
    pub fn fetch(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().ok()?;
        let (deadline, value) = entries.get(key)?;
        if let Some(deadline) = deadline {
            if Instant::now() >= *deadline {
                return None;
            }
        }
        Some(value.clone())
    }

    /// Store an entry with a TTL in seconds. Zero means no expiry.
    pub fn store(&self, key: &str, value: Value, ttl_secs: u64) {
        let deadline = if ttl_secs > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_secs))
        } else {
            None
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), (deadline, value));
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }
}

/// Cache key scoped to a data directory.
pub fn scoped_key(data_dir: &Path, name: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data_dir.to_string_lossy().as_bytes());
    format!("{}:{}", hex::encode(hasher.finalize()), name)
}
