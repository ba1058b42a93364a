//! Location registry.
//!
//! Locations live in `settings/locations.json` keyed by location ID, with an
//! optional `settings/locations-elastic.json` overlay merged on top (elastic
//! pools redefine a subset of locations at runtime). Parsed entries are cached
//! briefly; unknown locations resolve to a default entry rather than erroring
//! so a tester polling a retired location degrades gracefully.

use crate::cache::{scoped_key, ShortTtlCache};
use crate::config::{CoordinatorConfig, FALLBACK_CACHE_SECS, LOCATION_CACHE_SECS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationInfo {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub browser: String,
    /// Beanstalk broker address, `host:port` or `host`.
    #[serde(default)]
    pub beanstalkd: Option<String>,
    /// Explicitly named broker tube, overriding the derived per-location tube.
    #[serde(default)]
    pub beanstalkd_tube: Option<String>,
    /// Remote-scheduler node ID; presence selects the scheduler backend.
    #[serde(default)]
    pub scheduler_node: Option<String>,
    #[serde(default)]
    pub scheduler_url: Option<String>,
    /// Location API key required on job submission.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    /// Relay/capture shard prefix for generated test IDs.
    #[serde(default)]
    pub location_shard: Option<String>,
    /// Per-priority cap on queued jobs; zero means unlimited.
    #[serde(default)]
    pub queue_limit: u64,
}

pub struct Locations<'a> {
    config: &'a CoordinatorConfig,
    cache: &'a ShortTtlCache,
}

impl<'a> Locations<'a> {
    pub fn new(config: &'a CoordinatorConfig, cache: &'a ShortTtlCache) -> Self {
        Self { config, cache }
    }

    fn table(&self) -> BTreeMap<String, LocationInfo> {
        let key = scoped_key(&self.config.data_dir, "locations");
        if let Some(cached) = self.cache.fetch(&key) {
            if let Ok(table) = serde_json::from_value(cached) {
                return table;
            }
        }
        let table = load_table(self.config);
        if let Ok(value) = serde_json::to_value(&table) {
            self.cache.store(&key, value, LOCATION_CACHE_SECS);
        }
        table
    }

    /// Look up a location, defaulting for unknown IDs.
    pub fn resolve(&self, location: &str) -> LocationInfo {
        self.table().get(location).cloned().unwrap_or_default()
    }

    pub fn exists(&self, location: &str) -> bool {
        self.table().contains_key(location)
    }

    pub fn names(&self) -> Vec<String> {
        self.table().keys().cloned().collect()
    }

    /// Fallback chain for a location, nearest first, cycles broken.
    pub fn fallbacks(&self, location: &str) -> Vec<String> {
        let key = scoped_key(&self.config.data_dir, &format!("fallbacks:{location}"));
        if let Some(Value::Array(cached)) = self.cache.fetch(&key) {
            return cached
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        let table = self.table();
        let mut chain = Vec::new();
        let mut current = location.to_string();
        while let Some(next) = table.get(&current).and_then(|info| info.fallback.clone()) {
            if next == location || chain.contains(&next) {
                break;
            }
            chain.push(next.clone());
            current = next;
        }
        if let Ok(value) = serde_json::to_value(&chain) {
            self.cache.store(&key, value, FALLBACK_CACHE_SECS);
        }
        chain
    }
}

fn load_table(config: &CoordinatorConfig) -> BTreeMap<String, LocationInfo> {
    let mut table = BTreeMap::new();
    for name in ["locations.json", "locations-elastic.json"] {
        let path = config.settings_dir().join(name);
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<BTreeMap<String, LocationInfo>>(&text) {
            Ok(layer) => {
                for (id, info) in layer {
                    table.insert(id, info);
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to parse locations file");
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config_in(dir: &Path) -> CoordinatorConfig {
        CoordinatorConfig {
            data_dir: dir.to_path_buf(),
            port: 0,
        }
    }

    fn write_locations(dir: &Path, name: &str, body: &str) {
        let settings = dir.join("settings");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(settings.join(name), body).unwrap();
    }

    #[test]
    fn test_resolve_known_location() {
        let dir = tempfile::tempdir().unwrap();
        write_locations(
            dir.path(),
            "locations.json",
            r#"{"us-east": {"label": "Virginia", "browser": "Chrome", "key": "secret"}}"#,
        );
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let locations = Locations::new(&config, &cache);
        let info = locations.resolve("us-east");
        assert_eq!(info.label, "Virginia");
        assert_eq!(info.key.as_deref(), Some("secret"));
        assert!(locations.exists("us-east"));
    }

    #[test]
    fn test_unknown_location_gets_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let locations = Locations::new(&config, &cache);
        let info = locations.resolve("nowhere");
        assert!(info.label.is_empty());
        assert!(info.scheduler_node.is_none());
        assert!(!locations.exists("nowhere"));
    }

    #[test]
    fn test_elastic_overlay_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_locations(
            dir.path(),
            "locations.json",
            r#"{"eu-west": {"label": "Dublin"}}"#,
        );
        write_locations(
            dir.path(),
            "locations-elastic.json",
            r#"{"eu-west": {"label": "Dublin (elastic)", "beanstalkd": "10.0.0.5:11300"}}"#,
        );
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let locations = Locations::new(&config, &cache);
        let info = locations.resolve("eu-west");
        assert_eq!(info.label, "Dublin (elastic)");
        assert_eq!(info.beanstalkd.as_deref(), Some("10.0.0.5:11300"));
    }

    #[test]
    fn test_fallback_chain_breaks_cycles() {
        let dir = tempfile::tempdir().unwrap();
        write_locations(
            dir.path(),
            "locations.json",
            r#"{
                "a": {"fallback": "b"},
                "b": {"fallback": "c"},
                "c": {"fallback": "a"}
            }"#,
        );
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let locations = Locations::new(&config, &cache);
        assert_eq!(locations.fallbacks("a"), vec!["b".to_string(), "c".to_string()]);
    }
}
