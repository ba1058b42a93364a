use std::sync::Arc;
use std::time::Duration;

use crate::cache::ShortTtlCache;
use crate::config::{CoordinatorConfig, HTTP_CONNECT_TIMEOUT_SECS, HTTP_TOTAL_TIMEOUT_SECS};
use crate::locations::Locations;
use crate::queue::JobQueues;
use crate::settings::Settings;

/// Shared coordinator state: the resolved configuration, the short-TTL
/// read cache and the outbound HTTP client for scheduler calls.
pub struct CoordinatorState {
    pub config: CoordinatorConfig,
    pub cache: ShortTtlCache,
    pub http_client: reqwest::Client,
}

pub type SharedState = Arc<CoordinatorState>;

impl CoordinatorState {
    pub fn new(config: CoordinatorConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_TOTAL_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            cache: ShortTtlCache::new(),
            http_client,
        }
    }

    pub fn settings(&self) -> Settings<'_> {
        Settings::new(&self.config, &self.cache)
    }

    pub fn locations(&self) -> Locations<'_> {
        Locations::new(&self.config, &self.cache)
    }

    pub fn queues(&self) -> JobQueues<'_> {
        JobQueues::new(&self.config, &self.cache, &self.http_client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_COORDINATOR_PORT;
    use tempfile::TempDir;

    #[test]
    fn test_state_construction() {
        let dir = TempDir::new().unwrap();
        let state = CoordinatorState::new(CoordinatorConfig {
            data_dir: dir.path().to_path_buf(),
            port: DEFAULT_COORDINATOR_PORT,
        });
        assert_eq!(state.config.port, DEFAULT_COORDINATOR_PORT);
        assert!(state.locations().names().is_empty());
    }
}
