//! Layered server settings.
//!
//! Settings are JSON objects merged in order: `settings/settings.json`, then
//! `settings/common/settings.json`, then `settings/server/settings.json`.
//! Later layers win key by key. The merged map is cached for a short window
//! so per-request lookups stay off the disk.

use crate::cache::{scoped_key, ShortTtlCache};
use crate::config::{CoordinatorConfig, SETTINGS_CACHE_SECS};
use serde_json::{Map, Value};
use std::path::Path;

const LAYERS: [&str; 3] = [
    "settings.json",
    "common/settings.json",
    "server/settings.json",
];

pub struct Settings<'a> {
    config: &'a CoordinatorConfig,
    cache: &'a ShortTtlCache,
}

impl<'a> Settings<'a> {
    pub fn new(config: &'a CoordinatorConfig, cache: &'a ShortTtlCache) -> Self {
        Self { config, cache }
    }

    /// The merged settings object, cached briefly.
    pub fn all(&self) -> Map<String, Value> {
        let key = scoped_key(&self.config.data_dir, "settings");
        if let Some(Value::Object(map)) = self.cache.fetch(&key) {
            return map;
        }
        let merged = load_layers(&self.config.settings_dir());
        self.cache
            .store(&key, Value::Object(merged.clone()), SETTINGS_CACHE_SECS);
        merged
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.all().get(name).cloned()
    }

    pub fn get_str(&self, name: &str, default: &str) -> String {
        match self.all().get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn get_i64(&self, name: &str, default: i64) -> i64 {
        match self.all().get(name) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.all().get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(default),
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
            _ => default,
        }
    }
}

fn load_layers(settings_dir: &Path) -> Map<String, Value> {
    let mut merged = Map::new();
    for layer in LAYERS {
        let path = settings_dir.join(layer);
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => {
                for (k, v) in map {
                    merged.insert(k, v);
                }
            }
            Ok(_) => {
                tracing::warn!(path = %path.display(), "settings layer is not a JSON object");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to parse settings layer");
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;

    fn config_in(dir: &Path) -> CoordinatorConfig {
        CoordinatorConfig {
            data_dir: dir.to_path_buf(),
            port: 0,
        }
    }

    #[test]
    fn test_later_layers_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings");
        std::fs::create_dir_all(settings.join("server")).unwrap();
        std::fs::write(settings.join("settings.json"), r#"{"a": 1, "b": 1}"#).unwrap();
        std::fs::write(settings.join("server/settings.json"), r#"{"b": 2}"#).unwrap();

        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let s = Settings::new(&config, &cache);
        assert_eq!(s.get_i64("a", 0), 1);
        assert_eq!(s.get_i64("b", 0), 2);
    }

    #[test]
    fn test_missing_layers_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let s = Settings::new(&config, &cache);
        assert_eq!(s.get_i64("maxTesterMinutes", 60), 60);
        assert_eq!(s.get_str("host", "localhost"), "localhost");
        assert!(!s.get_bool("private", false));
    }

    #[test]
    fn test_string_and_number_coercion() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(
            settings.join("settings.json"),
            r#"{"shard": "3", "private": 1, "salt": 42}"#,
        )
        .unwrap();

        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let s = Settings::new(&config, &cache);
        assert_eq!(s.get_i64("shard", 0), 3);
        assert!(s.get_bool("private", false));
        assert_eq!(s.get_str("salt", ""), "42");
    }
}
