//! Remote-scheduler queue backend.
//!
//! Locations with a `scheduler_node` hand their jobs to an external
//! scheduler over CPID-signed HTTP. Dispatch to testers is push-based from
//! the scheduler side, so this backend only enqueues and reports status;
//! metadata and per-test status responses are cached briefly to avoid
//! hammering the scheduler from status polls.

use crate::cache::{scoped_key, ShortTtlCache};
use crate::config::{
    CoordinatorConfig, PRIORITY_LEVELS, SCHEDULER_QUEUE_CACHE_SECS, SCHEDULER_STATUS_CACHE_SECS,
};
use crate::cpid;
use crate::settings::Settings;
use serde_json::Value;

pub struct SchedulerQueue<'a> {
    config: &'a CoordinatorConfig,
    cache: &'a ShortTtlCache,
    client: &'a reqwest::Client,
}

struct SchedulerEndpoint {
    base_url: String,
    cpid: String,
}

impl<'a> SchedulerQueue<'a> {
    pub fn new(
        config: &'a CoordinatorConfig,
        cache: &'a ShortTtlCache,
        client: &'a reqwest::Client,
    ) -> Self {
        Self {
            config,
            cache,
            client,
        }
    }

    fn endpoint(&self) -> Option<SchedulerEndpoint> {
        let settings = Settings::new(self.config, self.cache);
        let scheduler = settings.get_str("cp_scheduler", "");
        let salt = settings.get_str("cp_scheduler_salt", "");
        if scheduler.is_empty() || salt.is_empty() {
            return None;
        }
        let host = settings.get_str("host", "");
        Some(SchedulerEndpoint {
            base_url: format!("{scheduler}hawkscheduleserver"),
            cpid: cpid::compute_cpid(&host, &salt),
        })
    }

    pub fn is_configured(&self) -> bool {
        let settings = Settings::new(self.config, self.cache);
        !settings.get_str("cp_scheduler", "").is_empty()
            && !settings.get_str("cp_scheduler_salt", "").is_empty()
    }

    /// Submit one job to the scheduler. Multi-run tests submit one job per
    /// run with IDs suffixed `.<run>` so runs execute in parallel.
    pub async fn enqueue(&self, job_id: &str, node: &str, priority: i64, body: String) -> bool {
        let Some(endpoint) = self.endpoint() else {
            return false;
        };
        let url = format!(
            "{}/wpt-enq.ashx?test={job_id}&node={node}&priority={priority}",
            endpoint.base_url
        );
        cpid::signed_post(self.client, &url, &endpoint.cpid, body)
            .await
            .is_some()
    }

    /// Per-priority queue lengths for a scheduler node, from the cached
    /// metadata snapshot.
    pub async fn queue_lengths(&self, node: &str) -> Vec<u64> {
        let mut queues = vec![0u64; PRIORITY_LEVELS];
        let Some(metadata) = self.metadata().await else {
            return queues;
        };
        if let Some(per_priority) = metadata
            .get("PriorityQueues")
            .and_then(|q| q.get(node))
            .and_then(Value::as_object)
        {
            for (priority, count) in per_priority {
                if let Ok(priority) = priority.parse::<usize>() {
                    if priority < PRIORITY_LEVELS {
                        queues[priority] = count.as_u64().unwrap_or(0);
                    }
                }
            }
        } else if let Some(count) = metadata.get("Queues").and_then(|q| q.get(node)) {
            queues[0] = count.as_u64().unwrap_or(0);
        }
        queues
    }

    async fn metadata(&self) -> Option<Value> {
        let key = scoped_key(&self.config.data_dir, "scheduler-queues");
        if let Some(cached) = self.cache.fetch(&key) {
            return Some(cached);
        }
        let endpoint = self.endpoint()?;
        let url = format!(
            "{}/wpt-metadata.ashx?queue=1&priorityqueue=1",
            endpoint.base_url
        );
        let text = cpid::signed_get(self.client, &url, &endpoint.cpid).await?;
        let metadata: Value = serde_json::from_str(&text).ok()?;
        self.cache
            .store(&key, metadata.clone(), SCHEDULER_QUEUE_CACHE_SECS);
        Some(metadata)
    }

    /// Status of a scheduled test, cached per test ID.
    pub async fn test_status(&self, test_id: &str) -> Option<Value> {
        let key = scoped_key(
            &self.config.data_dir,
            &format!("scheduler-status-{test_id}"),
        );
        if let Some(cached) = self.cache.fetch(&key) {
            return Some(cached);
        }
        let endpoint = self.endpoint()?;
        let url = format!("{}/wpt-test-queue.ashx?test={test_id}", endpoint.base_url);
        let text = cpid::signed_get(self.client, &url, &endpoint.cpid).await?;
        let status: Value = if text.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&text).ok()?
        };
        self.cache
            .store(&key, status.clone(), SCHEDULER_STATUS_CACHE_SECS);
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn config_in(dir: &Path) -> CoordinatorConfig {
        CoordinatorConfig {
            data_dir: dir.to_path_buf(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_unconfigured_scheduler_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        let client = reqwest::Client::new();
        let queue = SchedulerQueue::new(&config, &cache, &client);
        assert!(!queue.is_configured());
        assert!(!queue.enqueue("260830_AB_1", "node1", 0, "{}".into()).await);
        assert_eq!(queue.queue_lengths("node1").await, vec![0u64; 10]);
    }

    #[tokio::test]
    async fn test_queue_lengths_from_cached_priority_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        cache.store(
            &scoped_key(&config.data_dir, "scheduler-queues"),
            json!({"PriorityQueues": {"node1": {"0": 4, "3": 2}}}),
            15,
        );
        let client = reqwest::Client::new();
        let queue = SchedulerQueue::new(&config, &cache, &client);
        let lengths = queue.queue_lengths("node1").await;
        assert_eq!(lengths[0], 4);
        assert_eq!(lengths[3], 2);
        assert_eq!(lengths[1], 0);
    }

    #[tokio::test]
    async fn test_queue_lengths_fall_back_to_flat_queues() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        cache.store(
            &scoped_key(&config.data_dir, "scheduler-queues"),
            json!({"Queues": {"node1": 7}}),
            15,
        );
        let client = reqwest::Client::new();
        let queue = SchedulerQueue::new(&config, &cache, &client);
        let lengths = queue.queue_lengths("node1").await;
        assert_eq!(lengths[0], 7);
        assert_eq!(lengths.iter().sum::<u64>(), 7);
    }

    #[tokio::test]
    async fn test_cached_test_status_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let cache = ShortTtlCache::new();
        cache.store(
            &scoped_key(&config.data_dir, "scheduler-status-260830_AB_1"),
            json!({"position": 3}),
            15,
        );
        let client = reqwest::Client::new();
        let queue = SchedulerQueue::new(&config, &cache, &client);
        let status = queue.test_status("260830_AB_1").await.unwrap();
        assert_eq!(status["position"], 3);
    }
}
