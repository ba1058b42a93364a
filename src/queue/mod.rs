//! Job queue engine.
//!
//! Each location resolves to one of three backends: the file-backed local
//! queue, a beanstalk broker tube, or the remote scheduler. The backend is
//! picked once per location from its registry entry and all queue operations
//! dispatch through it.

pub mod broker;
pub mod local;
pub mod scheduler;

use crate::cache::ShortTtlCache;
use crate::config::{CoordinatorConfig, PRIORITY_LEVELS};
use crate::gzio;
use crate::locations::LocationInfo;
use crate::settings::Settings;
use broker::BrokerClient;
use scheduler::SchedulerQueue;
use serde_json::{json, Value};

/// Global broker accelerating the file-backed queues. With `api_only` the
/// file queue keeps priority 0 and the tubes carry only priorities 1-9.
struct GlobalBroker {
    addr: String,
    api_only: bool,
}

impl GlobalBroker {
    fn file_queue_enabled(&self) -> bool {
        self.api_only
    }

    fn covers(&self, priority: usize) -> bool {
        priority > 0 || !self.api_only
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueBackend {
    Local,
    Broker { addr: String, tube: String },
    RemoteScheduler { node: String },
}

/// Pick the queue backend for a location.
pub fn backend_for(location: &str, info: &LocationInfo) -> QueueBackend {
    if let Some(node) = &info.scheduler_node {
        return QueueBackend::RemoteScheduler { node: node.clone() };
    }
    if let Some(addr) = &info.beanstalkd {
        let tube = info
            .beanstalkd_tube
            .clone()
            .unwrap_or_else(|| broker::location_tube(location));
        return QueueBackend::Broker {
            addr: addr.clone(),
            tube,
        };
    }
    QueueBackend::Local
}

pub struct JobQueues<'a> {
    config: &'a CoordinatorConfig,
    cache: &'a ShortTtlCache,
    client: &'a reqwest::Client,
}

pub struct WorkItem {
    pub payload: String,
    pub priority: usize,
}

impl<'a> JobQueues<'a> {
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

    fn scheduler(&self) -> SchedulerQueue<'a> {
        SchedulerQueue::new(self.config, self.cache, self.client)
    }

    fn global_broker(&self) -> Option<GlobalBroker> {
        let settings = Settings::new(self.config, self.cache);
        let addr = settings.get_str("beanstalkd", "");
        if addr.is_empty() {
            return None;
        }
        Some(GlobalBroker {
            addr,
            api_only: settings.get_bool("beanstalk_api_only", false),
        })
    }

    fn work_tube(&self, location: &str, priority: usize) -> String {
        let work_dir = self.config.work_dir_for(location);
        broker::priority_tube(&work_dir.to_string_lossy(), priority)
    }

    /// Enqueue a test for a location, one job per run so multi-run tests can
    /// execute in parallel. Returns false if any run failed to enqueue.
    pub async fn enqueue_test(
        &self,
        location: &str,
        info: &LocationInfo,
        test_id: &str,
        job: &Value,
        runs: u32,
        priority: usize,
        affinity: Option<&str>,
    ) -> bool {
        let backend = backend_for(location, info);
        let runs = runs.max(1);
        let mut ok = true;
        for run in 1..=runs {
            let mut job = job.clone();
            let job_id = if run > 1 {
                format!("{test_id}.{run}")
            } else {
                test_id.to_string()
            };
            if let Value::Object(map) = &mut job {
                if runs > 1 {
                    map.insert("run".to_string(), json!(run));
                }
                map.insert("jobID".to_string(), json!(job_id));
            }
            let submitted = match &backend {
                QueueBackend::RemoteScheduler { node } => {
                    let body = job.to_string();
                    self.scheduler()
                        .enqueue(&job_id, node, priority as i64, body)
                        .await
                }
                QueueBackend::Broker { addr, tube } => {
                    let envelope = json!({ "job": job }).to_string();
                    match gzio::deflate(envelope.as_bytes()) {
                        Ok(packed) => {
                            BrokerClient::new(addr)
                                .put(tube, priority as u32 + 1, &packed)
                                .await
                        }
                        Err(_) => false,
                    }
                }
                QueueBackend::Local => {
                    let sequence = crate::testid::next_test_num(self.config).await.unwrap_or(0);
                    let file = local::job_file_name(sequence, affinity, &job_id, priority);
                    match self.global_broker() {
                        Some(global) if global.covers(priority) => {
                            local::write_job_file(
                                self.config,
                                location,
                                &file,
                                &job.to_string(),
                            ) && BrokerClient::new(&global.addr)
                                .put(
                                    &self.work_tube(location, priority),
                                    priority as u32 + 1,
                                    file.as_bytes(),
                                )
                                .await
                        }
                        _ => {
                            local::enqueue(
                                self.config,
                                location,
                                &file,
                                &job.to_string(),
                                priority,
                                info.queue_limit,
                            )
                            .await
                        }
                    }
                }
            };
            if !submitted {
                ok = false;
            }
        }
        ok
    }

    /// Hand the next eligible job to a polling tester.
    pub async fn get_work(
        &self,
        location: &str,
        info: &LocationInfo,
        tester: Option<&str>,
        tester_index: Option<usize>,
        tester_count: Option<usize>,
    ) -> Option<WorkItem> {
        match backend_for(location, info) {
            QueueBackend::Broker { addr, tube } => {
                let packed = BrokerClient::new(&addr).take(&tube).await?;
                let inflated = gzio::inflate(&packed).ok()?;
                let envelope: Value = serde_json::from_slice(&inflated).ok()?;
                let job = envelope.get("job")?;
                Some(WorkItem {
                    payload: job.to_string(),
                    priority: 0,
                })
            }
            QueueBackend::RemoteScheduler { .. } => None,
            QueueBackend::Local => {
                let global = self.global_broker();
                let mut job = None;
                if global.as_ref().map_or(true, GlobalBroker::file_queue_enabled) {
                    job = local::dequeue(self.config, location, tester, tester_index, tester_count)
                        .await;
                }
                if job.is_none() {
                    if let Some(global) = &global {
                        job = self.take_brokered_job(&global.addr, location).await;
                    }
                }
                job.map(|job| WorkItem {
                    payload: job.payload,
                    priority: job.priority,
                })
            }
        }
    }

    /// Drain the per-priority tubes in ascending order. Tube entries are job
    /// file names; names whose file has vanished are discarded and the same
    /// tube is polled again.
    async fn take_brokered_job(&self, addr: &str, location: &str) -> Option<local::DequeuedJob> {
        let client = BrokerClient::new(addr);
        for priority in 0..PRIORITY_LEVELS {
            let tube = self.work_tube(location, priority);
            while let Some(payload) = client.take(&tube).await {
                let Ok(file) = String::from_utf8(payload) else {
                    continue;
                };
                if let Some(job) = local::claim_job_file(self.config, location, &file) {
                    return Some(job);
                }
            }
        }
        None
    }

    /// Per-priority queue lengths for a location.
    pub async fn lengths(&self, location: &str, info: &LocationInfo) -> Vec<u64> {
        match backend_for(location, info) {
            QueueBackend::Broker { addr, tube } => {
                let mut queues = vec![0u64; PRIORITY_LEVELS];
                queues[0] = BrokerClient::new(&addr).ready_count(&tube).await;
                queues
            }
            QueueBackend::RemoteScheduler { node } => self.scheduler().queue_lengths(&node).await,
            QueueBackend::Local => {
                let global = self.global_broker();
                let mut queues = if global.as_ref().map_or(true, GlobalBroker::file_queue_enabled)
                {
                    local::lengths(self.config, location)
                } else {
                    vec![0u64; PRIORITY_LEVELS]
                };
                if let Some(global) = &global {
                    let client = BrokerClient::new(&global.addr);
                    for (priority, slot) in queues.iter_mut().enumerate() {
                        *slot += client
                            .ready_count(&self.work_tube(location, priority))
                            .await;
                    }
                }
                queues
            }
        }
    }

    /// Pending work: total across priorities 0-8, plus the priority-0 count
    /// used for status displays.
    pub async fn pending_tests(&self, location: &str, info: &LocationInfo) -> (u64, u64) {
        let lengths = self.lengths(location, info).await;
        let total: u64 = lengths.iter().take(9).sum();
        (total, lengths[0])
    }

    /// Jobs strictly ahead of a test, `-1` if not queued. Brokered and
    /// scheduled queues cannot see relative order, so a queued test reports
    /// position 0.
    pub async fn position(&self, location: &str, info: &LocationInfo, test_id: &str) -> i64 {
        match backend_for(location, info) {
            QueueBackend::Local => {
                let global = self.global_broker();
                let mut position = -1;
                if global.as_ref().map_or(true, GlobalBroker::file_queue_enabled) {
                    position = local::position(self.config, location, test_id);
                }
                if position < 0 {
                    // Tube entries cannot be enumerated; any ready job means
                    // the test is queued somewhere near the front.
                    if let Some(global) = &global {
                        let client = BrokerClient::new(&global.addr);
                        for priority in 0..PRIORITY_LEVELS {
                            if client
                                .ready_count(&self.work_tube(location, priority))
                                .await
                                > 0
                            {
                                position = 0;
                                break;
                            }
                        }
                    }
                }
                position
            }
            QueueBackend::Broker { .. } | QueueBackend::RemoteScheduler { .. } => 0,
        }
    }

    /// Scheduler-side status for a test, when that backend owns it.
    pub async fn scheduler_status(&self, test_id: &str) -> Option<Value> {
        self.scheduler().test_status(test_id).await
    }
}
