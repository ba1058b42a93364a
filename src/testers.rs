//! Tester registry.
//!
//! Every tester poll upserts a gzip JSON record under
//! `tmp/testers-<location>/<sha1(tester)>.json`. Records keep rolling CPU and
//! error samples plus first-contact and last-work timestamps; the roster view
//! is cached briefly and prunes testers that have gone quiet, leaving the
//! most recently updated stale record behind so an offline location still
//! reports how long it has been dark.

use crate::cache::{scoped_key, ShortTtlCache};
use crate::config::{
    CoordinatorConfig, LOCATION_OFFLINE_MINUTES, MAX_TESTER_MINUTES_DEFAULT,
    MAX_TESTER_MINUTES_MAX, MAX_TESTER_MINUTES_MIN, TESTER_CACHE_SECS, TESTER_SAMPLE_CAP,
};
use crate::gzio;
use crate::settings::Settings;
use chrono::Utc;
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Default)]
pub struct TesterUpdate {
    /// Capability and status fields reported by the tester, merged into the
    /// record verbatim.
    pub info: Option<Map<String, Value>>,
    pub cpu: Option<f64>,
    /// Empty string counts as a success sample, anything else as an error.
    pub error: Option<String>,
    pub rebooted: Option<bool>,
}

fn testers_dir(config: &CoordinatorConfig, location: &str) -> PathBuf {
    config.tmp_dir().join(format!("testers-{location}"))
}

fn record_path(config: &CoordinatorConfig, location: &str, tester: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(tester.as_bytes());
    testers_dir(config, location).join(format!("{}.json", hex::encode(hasher.finalize())))
}

fn push_sample(record: &mut Map<String, Value>, key: &str, sample: f64) {
    let samples = record
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = samples {
        list.push(json!(sample));
        if list.len() > TESTER_SAMPLE_CAP {
            list.remove(0);
        }
    }
}

fn has_active_test(record: &Map<String, Value>) -> bool {
    record
        .get("test")
        .and_then(Value::as_str)
        .map(|t| !t.is_empty())
        .unwrap_or(false)
}

/// Record a tester contact.
pub fn update_tester(
    config: &CoordinatorConfig,
    location: &str,
    tester: &str,
    update: TesterUpdate,
) {
    let path = record_path(config, location, tester);
    let mut record: Map<String, Value> = gzio::gz_read_to_string(&path)
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    let now = Utc::now().timestamp();
    record.insert("updated".to_string(), json!(now));
    record
        .entry("first_contact".to_string())
        .or_insert_with(|| json!(now));

    if let Some(rebooted) = update.rebooted {
        record.insert("rebooted".to_string(), json!(rebooted));
    }
    if let Some(cpu) = update.cpu {
        if cpu > 0.0 {
            push_sample(&mut record, "cpu", cpu);
        }
    }
    if let Some(error) = &update.error {
        push_sample(&mut record, "errors", if error.is_empty() { 0.0 } else { 100.0 });
    }

    if let Some(info) = update.info {
        // The first busy observation pins `last` so idle time is measured
        // from when work was actually assigned.
        let incoming_busy = info
            .get("test")
            .and_then(Value::as_str)
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if incoming_busy || has_active_test(&record) {
            record.insert("last".to_string(), json!(now));
        }
        for (key, value) in info {
            record.insert(key, value);
        }
    }
    record.insert("id".to_string(), json!(tester));

    if let Ok(serialized) = serde_json::to_vec(&Value::Object(record)) {
        if let Err(err) = gzio::gz_write(&path, &serialized) {
            tracing::warn!(location, tester, %err, "failed to persist tester record");
        }
    }
}

fn max_tester_minutes(settings: &Settings) -> i64 {
    settings
        .get_i64("max_tester_minutes", MAX_TESTER_MINUTES_DEFAULT)
        .clamp(MAX_TESTER_MINUTES_MIN, MAX_TESTER_MINUTES_MAX)
}

const PASSTHROUGH_FIELDS: [(&str, &str); 15] = [
    ("pc", "pc"),
    ("ec2", "ec2"),
    ("ip", "ip"),
    ("ver", "version"),
    ("freedisk", "freedisk"),
    ("upminutes", "upminutes"),
    ("ie", "ie"),
    ("winver", "winver"),
    ("isWinServer", "isWinServer"),
    ("isWin64", "isWin64"),
    ("dns", "dns"),
    ("GPU", "GPU"),
    ("offline", "offline"),
    ("screenwidth", "screenwidth"),
    ("screenheight", "screenheight"),
];

fn sample_average(record: &Map<String, Value>, key: &str, min_samples: usize) -> Option<i64> {
    let list = record.get(key)?.as_array()?;
    if list.is_empty() || list.len() < min_samples {
        return None;
    }
    let sum: f64 = list.iter().filter_map(Value::as_f64).sum();
    Some((sum / list.len() as f64).round() as i64)
}

/// Roster snapshot for a location: `status`, minutes since last contact, and
/// one entry per (optionally online) tester.
pub fn get_testers(
    config: &CoordinatorConfig,
    cache: &ShortTtlCache,
    location: &str,
    include_offline: bool,
    include_sensitive: bool,
) -> Value {
    let cache_key = scoped_key(
        &config.data_dir,
        &format!("testers:{location}-{include_offline}-{include_sensitive}"),
    );
    if let Some(cached) = cache.fetch(&cache_key) {
        return cached;
    }

    let settings = Settings::new(config, cache);
    let max_minutes = max_tester_minutes(&settings);
    let mut snapshot = Map::new();
    let now = Utc::now().timestamp();
    let mut freshest_elapsed: Option<i64> = None;
    let mut records: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut stale: Vec<(i64, PathBuf)> = Vec::new();

    let dir = testers_dir(config, location);
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json.gz") {
                continue;
            }
            let base = dir.join(name.trim_end_matches(".gz"));
            let Some(record) = gzio::gz_read_to_string(&base)
                .and_then(|text| serde_json::from_str::<Map<String, Value>>(&text).ok())
            else {
                continue;
            };
            let mut elapsed = 0i64;
            if let Some(updated) = record.get("updated").and_then(Value::as_i64) {
                elapsed = if now < updated { 0 } else { (now - updated) / 60 };
                if freshest_elapsed.map(|e| elapsed < e).unwrap_or(true) {
                    freshest_elapsed = Some(elapsed);
                }
            }
            if elapsed > max_minutes {
                let updated = record.get("updated").and_then(Value::as_i64).unwrap_or(0);
                stale.push((updated, entry.path()));
            } else if let Some(id) = record.get("id").and_then(Value::as_str) {
                records.insert(id.to_string(), record);
            }
        }
    }

    // Delete stale records. When nothing fresh remains, the most recently
    // updated one is retained so the offline duration is still visible.
    stale.sort_by_key(|(updated, _)| *updated);
    if records.is_empty() {
        stale.pop();
    }
    for (_, path) in &stale {
        let _ = std::fs::remove_file(path);
    }

    if !records.is_empty() {
        let mut testers = Vec::new();
        for (id, record) in &records {
            let offline = record
                .get("offline")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if offline && !include_offline {
                continue;
            }
            let mut entry = Map::new();
            entry.insert("id".to_string(), json!(id));
            for (source, target) in PASSTHROUGH_FIELDS {
                if let Some(value) = record.get(source) {
                    entry.insert(target.to_string(), value.clone());
                }
            }
            if include_sensitive {
                if let Some(test) = record.get("test") {
                    entry.insert("test".to_string(), test.clone());
                }
            }
            if let Some(browsers) = record.get("browsers") {
                entry.insert("browsers".to_string(), browsers.clone());
            }
            entry.insert(
                "rebooted".to_string(),
                record.get("rebooted").cloned().unwrap_or(json!(false)),
            );
            if let Some(cpu) = sample_average(record, "cpu", 1) {
                entry.insert("cpu".to_string(), json!(cpu));
            }
            if let Some(errors) = sample_average(record, "errors", 51) {
                entry.insert("errors".to_string(), json!(errors));
            }
            if let Some(updated) = record.get("updated").and_then(Value::as_i64) {
                let elapsed = if now < updated { 0 } else { (now - updated) / 60 };
                entry.insert("elapsed".to_string(), json!(elapsed));
            }
            if let Some(last) = record.get("last").and_then(Value::as_i64) {
                let minutes = if now < last { 0 } else { (now - last) / 60 };
                entry.insert("last".to_string(), json!(minutes));
            }
            entry.insert("busy".to_string(), json!(has_active_test(record) as i64));
            testers.push(Value::Object(entry));
        }
        snapshot.insert("testers".to_string(), Value::Array(testers));
    }

    if let Some(elapsed) = freshest_elapsed {
        snapshot.insert("elapsed".to_string(), json!(elapsed));
    }
    let status = match freshest_elapsed {
        Some(elapsed) if elapsed < LOCATION_OFFLINE_MINUTES => "OK",
        _ => "OFFLINE",
    };
    snapshot.insert("status".to_string(), json!(status));

    let snapshot = Value::Object(snapshot);
    cache.store(&cache_key, snapshot.clone(), TESTER_CACHE_SECS);
    snapshot
}

/// Count of online testers seen within the last hour.
pub fn tester_count(config: &CoordinatorConfig, cache: &ShortTtlCache, location: &str) -> u64 {
    let location = location.split(':').next().unwrap_or(location);
    let snapshot = get_testers(config, cache, location, false, true);
    let Some(testers) = snapshot.get("testers").and_then(Value::as_array) else {
        return 0;
    };
    testers
        .iter()
        .filter(|t| {
            let offline = t.get("offline").and_then(Value::as_bool).unwrap_or(false);
            let elapsed = t.get("elapsed").and_then(Value::as_i64).unwrap_or(i64::MAX);
            !offline && elapsed < 60
        })
        .count() as u64
}
