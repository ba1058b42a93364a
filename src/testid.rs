//! Test identity, sharding and on-disk result paths.
//!
//! Test IDs look like `ymd_<shard>_<sequence>`. The sequence resets daily and
//! is issued under the "Unique ID" lock; the shard key spreads result
//! directories across the filesystem and can embed a capture prefix, location
//! and server ID for cross-server routing.

use crate::config::{CoordinatorConfig, DEFAULT_LOCK_SECS};
use crate::error::CoordinatorError;
use crate::lock;
use crate::settings::Settings;
use chrono::{Datelike, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

const BASE32_DIGITS: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const SORTABLE_DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Base-32 encoding used for test sequence numbers. The alphabet skips
/// easily-confused letters (I, L, O, U).
pub fn num_to_string(mut num: u64) -> String {
    if num == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while num > 0 {
        out.push(BASE32_DIGITS[(num % 32) as usize]);
        num /= 32;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Base-36, zero-padded so lexical order matches numeric order. Used for
/// job-file names so a directory scan yields FIFO order.
pub fn sortable_string(mut num: u64, target_len: usize) -> String {
    let mut out = Vec::new();
    while num > 0 {
        out.push(SORTABLE_DIGITS[(num % 36) as usize]);
        num /= 36;
    }
    out.reverse();
    let mut s = String::from_utf8(out).unwrap_or_default();
    while s.len() < target_len {
        s.insert(0, '0');
    }
    s
}

#[derive(Serialize, Deserialize)]
struct DayCounter {
    day: i64,
    num: u64,
}

fn bump_counter(path: &PathBuf, day: i64) -> std::io::Result<u64> {
    let mut counter = DayCounter { day, num: 0 };
    if let Ok(text) = std::fs::read_to_string(path) {
        if let Ok(existing) = serde_json::from_str::<DayCounter>(&text) {
            if existing.day == day {
                counter.num = existing.num;
            }
        }
    }
    counter.num += 1;
    let serialized = serde_json::to_string(&counter)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, serialized)?;
    Ok(counter.num)
}

/// Next value of the daily unique-ID sequence, plus its base-32 form.
/// Falls back to a random ID if the lock cannot be taken.
pub async fn unique_id(config: &CoordinatorConfig) -> (String, u64) {
    let jobs_dir = config.work_jobs_dir();
    if std::fs::create_dir_all(&jobs_dir).is_err() {
        return random_fallback();
    }
    let guard = lock::acquire(
        &config.tmp_dir(),
        "Unique ID",
        Duration::from_secs(DEFAULT_LOCK_SECS),
        Duration::from_secs(DEFAULT_LOCK_SECS),
    )
    .await;
    if guard.is_none() {
        return random_fallback();
    }
    let day = Utc::now().ordinal() as i64;
    match bump_counter(&jobs_dir.join("uniqueId.dat"), day) {
        Ok(num) => (num_to_string(num), num),
        Err(err) => {
            tracing::warn!(%err, "failed to persist unique ID counter");
            random_fallback()
        }
    }
}

fn random_fallback() -> (String, u64) {
    let num: u64 = rand::thread_rng().gen();
    (random_hex32(), num)
}

/// Daily test-number counter in `dat/testnum.dat`, under the "TestNum" lock.
pub async fn next_test_num(config: &CoordinatorConfig) -> Option<u64> {
    let dat_dir = config.dat_dir();
    std::fs::create_dir_all(&dat_dir).ok()?;
    let _guard = lock::acquire(
        &config.tmp_dir(),
        "TestNum",
        Duration::from_secs(DEFAULT_LOCK_SECS),
        Duration::from_secs(DEFAULT_LOCK_SECS),
    )
    .await?;
    let day: i64 = Utc::now().format("%y%m%d").to_string().parse().ok()?;
    bump_counter(&dat_dir.join("testnum.dat"), day).ok()
}

/// Shard portion of a test ID.
///
/// `bucket_size` groups tests sequentially; otherwise a random shard of
/// `shard` characters (default 2) spreads them. A capture prefix, location and
/// server ID are layered on when configured.
pub fn shard_key(test_num: u64, location_id: Option<&str>, settings: &Settings) -> String {
    let mut key = String::new();
    let bucket_size = settings.get_i64("bucket_size", 0);
    if bucket_size > 0 {
        key = format!("{}_", num_to_string(test_num / bucket_size as u64));
    } else {
        let size = settings.get_i64("shard", 2);
        if (1..20).contains(&size) {
            let mut rng = rand::thread_rng();
            for _ in 0..size {
                let idx = rng.gen_range(0..BASE32_DIGITS.len());
                key.push(BASE32_DIGITS[idx] as char);
            }
            key.push('_');
        }
    }

    let capture_prefix = settings.get_str("cp_capture_prefix", "");
    if !capture_prefix.is_empty() {
        key = format!("{capture_prefix}c{key}");
    }

    if let Some(location) = location_id {
        if !key.is_empty() {
            let clean: String = location.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if !clean.is_empty() {
                key = format!("{clean}x{key}");
            }
        }
    }

    if !key.is_empty() {
        let server: String = settings
            .get_str("serverID", "")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if !server.is_empty() {
            key = format!("{server}i{key}");
        }
    }

    key
}

fn random_hex32() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a fresh test ID, retrying with random suffixes if the target
/// result directory already exists.
pub async fn generate_test_id(
    config: &CoordinatorConfig,
    settings: &Settings<'_>,
    private: bool,
    location_shard: Option<&str>,
) -> String {
    let (seq, test_num) = unique_id(config).await;
    let today = Utc::now().format("%y%m%d").to_string();
    let suffix = if private { random_hex32() } else { seq };
    let mut test_id = format!(
        "{today}_{}{suffix}",
        shard_key(test_num, location_shard, settings)
    );
    while config.data_dir.join(test_path(&test_id)).is_dir() {
        test_id = format!(
            "{today}_{}{}",
            shard_key(test_num, location_shard, settings),
            random_hex32()
        );
    }
    test_id
}

/// Relative path of a test's result directory.
///
/// Modern IDs (`ymd_` prefix, `_` at offset 6) fan out as
/// `results/aa/bb/cc/<shard>[/<extra>]`; relay IDs carry their key before the
/// last `.`; anything else maps to the legacy flat layout.
pub fn test_path(id: &str) -> PathBuf {
    let mut base = PathBuf::from("results");
    let mut id = id;
    if let Some(separator) = id.rfind('.') {
        let key = id[..separator].trim();
        let real_id = id[separator + 1..].trim();
        if !key.is_empty() && !real_id.is_empty() {
            base = base.join("relay").join(key);
            id = real_id;
        }
    }

    if id.find('_') == Some(6) {
        let parts: Vec<&str> = id.split('_').collect();
        let date = parts[0];
        let mut dir = parts.get(1).copied().unwrap_or("").to_string();
        if let Some(extra) = parts.get(2) {
            if !extra.is_empty() {
                dir = format!("{dir}/{extra}");
            }
        }
        return base
            .join(&date[0..2])
            .join(&date[2..4])
            .join(&date[4..6])
            .join(dir);
    }

    base.join(id)
}

fn test_id_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^(?:[a-zA-Z0-9_]+\.?)+$").unwrap())
}

/// Validate a test ID. Invalid IDs abort the request.
pub fn validate_test_id(id: &str) -> Result<(), CoordinatorError> {
    let mut test_id = id;
    // Relay IDs carry the key before a single dot.
    if id.contains('.') {
        let parts: Vec<&str> = id.split('.').collect();
        if parts.len() == 2 {
            test_id = parts[1].trim();
        }
    }
    if !test_id_pattern().is_match(test_id) {
        return Err(CoordinatorError::InvalidTestId);
    }
    let test_year: i32 = test_id.get(0..2).and_then(|s| s.parse().ok()).unwrap_or(-1);
    let current_year = Utc::now().year() % 100;
    if (8..=current_year).contains(&test_year) {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidTestId)
    }
}

fn server_id_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\d{6}_([^_i]+)i").unwrap())
}

/// URL of the server that owns a test, when the ID embeds a different
/// server's shard prefix.
pub fn server_for_test(id: &str, settings: &Settings) -> Option<String> {
    let captures = server_id_pattern().captures(id)?;
    let test_server = captures.get(1)?.as_str();
    let current = settings.get_str("serverID", "");
    if current.is_empty() || current == test_server {
        return None;
    }
    let url = settings.get_str(&format!("server_{test_server}"), "");
    if url.is_empty() {
        None
    } else {
        Some(url)
    }
}

/// Whether a test is past the configured archive retention window.
pub fn test_archive_expired(id: &str, settings: &Settings) -> bool {
    let retain_months = settings.get_i64("archive_retention_months", 0);
    if retain_months <= 0 {
        return false;
    }
    let Some(date_part) = id.get(0..6) else {
        return false;
    };
    let Ok(test_date) = NaiveDate::parse_from_str(date_part, "%y%m%d") else {
        return false;
    };
    let elapsed = Utc::now().date_naive().signed_duration_since(test_date);
    elapsed.num_seconds() > retain_months * 31 * 86_400
}
