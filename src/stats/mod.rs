//! C5 — Stats & Health.
//!
//! One-shot per-container stats collection with derived metrics, a
//! restartable monitor stream, concurrent fan-out across many containers,
//! and daemon/container health probes.
//!
//! Grounded on `docker/service.rs::get_container_stats()`/`stream_stats()` (the
//! cpu/memory/network/blkio aggregation arithmetic) and
//! `environment/docker/stats.rs`'s `calculate_cpu`/`calculate_memory`
//! helpers, consolidated into one module instead of two
//! near-duplicate implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::runtime::{RawStats, RuntimeClient};

/// One derived stats sample for a container.
#[derive(Debug, Clone, Default)]
pub struct StatSample {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub rx_mb: f64,
    pub tx_mb: f64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
    pub timestamp: DateTime<Utc>,
}

fn derive(raw: &RawStats) -> StatSample {
    let cpu_delta = raw.cpu_total_usage.saturating_sub(raw.prev_cpu_total_usage) as f64;
    let system_delta = raw.cpu_system_usage.saturating_sub(raw.prev_cpu_system_usage) as f64;
    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * raw.online_cpus.max(1) as f64 * 100.0
    } else {
        0.0
    };

    // Cache is not "used" memory from the workload's perspective.
    let memory_usage = raw.memory_usage.saturating_sub(raw.memory_cache);
    let memory_percent = if raw.memory_limit > 0 {
        (memory_usage as f64 / raw.memory_limit as f64) * 100.0
    } else {
        0.0
    };

    StatSample {
        cpu_percent,
        memory_usage_bytes: memory_usage,
        memory_limit_bytes: raw.memory_limit,
        memory_percent,
        rx_mb: raw.rx_bytes as f64 / (1024.0 * 1024.0),
        tx_mb: raw.tx_bytes as f64 / (1024.0 * 1024.0),
        block_read_bytes: raw.block_read,
        block_write_bytes: raw.block_write,
        pids: raw.pids,
        timestamp: Utc::now(),
    }
}

/// Sum/average across a stats fan-out result (`AggregatedStats`).
#[derive(Debug, Clone, Default)]
pub struct AggregatedStats {
    pub container_count: usize,
    pub total_cpu_percent: f64,
    pub average_cpu_percent: f64,
    pub total_memory_usage_bytes: u64,
    pub total_rx_mb: f64,
    pub total_tx_mb: f64,
}

/// Container health, as reported by the runtime or derived from run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// No healthcheck is configured; derived from `running ⇔ healthy`.
    NoHealthcheck { running: bool },
}

/// Periodic stats collection and health probing.
pub struct StatsCollector {
    runtime: Arc<dyn RuntimeClient>,
    cache: DashMap<String, StatSample>,
}

impl StatsCollector {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            cache: DashMap::new(),
        }
    }

    /// One-shot stats read for a single container, updating the cache.
    pub async fn collect(&self, container_id: &str) -> Result<StatSample> {
        let raw = self.runtime.container_stats(container_id).await?;
        let sample = derive(&raw);
        self.cache.insert(container_id.to_string(), sample.clone());
        Ok(sample)
    }

    /// The most-recent cached sample, if any ("readers may see stale
    /// samples, never torn ones" — `DashMap`'s sharded locking gives this).
    pub fn cached(&self, container_id: &str) -> Option<StatSample> {
        self.cache.get(container_id).map(|e| e.value().clone())
    }

    /// Fans stats collection out across `container_ids` concurrently.
    /// Containers whose stats call fails are silently skipped — partial is
    /// better than none.
    pub async fn collect_all(&self, container_ids: &[String]) -> HashMap<String, StatSample> {
        let futures = container_ids.iter().map(|id| async move {
            match self.collect(id).await {
                Ok(sample) => Some((id.clone(), sample)),
                Err(e) => {
                    debug!(container_id = %id, error = %e, "skipping container in stats fan-out");
                    None
                }
            }
        });
        join_all(futures).await.into_iter().flatten().collect()
    }

    pub fn aggregate(samples: &HashMap<String, StatSample>) -> AggregatedStats {
        let count = samples.len();
        let total_cpu: f64 = samples.values().map(|s| s.cpu_percent).sum();
        AggregatedStats {
            container_count: count,
            total_cpu_percent: total_cpu,
            average_cpu_percent: if count > 0 { total_cpu / count as f64 } else { 0.0 },
            total_memory_usage_bytes: samples.values().map(|s| s.memory_usage_bytes).sum(),
            total_rx_mb: samples.values().map(|s| s.rx_mb).sum(),
            total_tx_mb: samples.values().map(|s| s.tx_mb).sum(),
        }
    }

    /// Yields a restartable stream of samples at `interval`, until the
    /// caller drops the receiver (`Monitor`).
    pub fn monitor(self: &Arc<Self>, container_id: String, interval: Duration) -> mpsc::Receiver<Result<StatSample>> {
        let (tx, rx) = mpsc::channel(16);
        let collector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = collector.collect(&container_id).await;
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Daemon reachability probe (`CheckDaemon`).
    pub async fn check_daemon(&self) -> Result<()> {
        self.runtime.ping().await
    }

    /// Container health: runtime-reported health status if a healthcheck is
    /// configured, otherwise `running ⇔ healthy` (`CheckContainer`).
    pub async fn check_container(&self, container_id: &str) -> Result<HealthStatus> {
        let container = self.runtime.container_inspect(container_id).await?;
        if let Some(status) = container.health_status {
            return Ok(match status.as_str() {
                "healthy" => HealthStatus::Healthy,
                "starting" => HealthStatus::Starting,
                _ => HealthStatus::Unhealthy,
            });
        }
        Ok(HealthStatus::NoHealthcheck {
            running: container.status == "running",
        })
    }

    /// Polls [`check_container`](Self::check_container) until it reports
    /// healthy or `timeout` elapses (`WaitHealthy`).
    pub async fn wait_healthy(&self, container_id: &str, timeout: Duration, poll_interval: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let status = self.check_container(container_id).await?;
                let healthy = matches!(
                    status,
                    HealthStatus::Healthy | HealthStatus::NoHealthcheck { running: true }
                );
                if healthy {
                    return Ok(());
                }
                tokio::time::sleep(poll_interval).await;
            }
        }).await.map_err(|_| crate::error::OrchestratorError::timeout(format!("{container_id} did not become healthy in time")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_manager::{ContainerManager, CreateWorkspaceContainerRequest};
    use crate::isolation::IsolationConfig;
    use crate::runtime::fake::FakeRuntimeClient;
    use std::collections::HashMap as Map;

    fn isolation() -> IsolationConfig {
        IsolationConfig {
            cpu_quota: 100_000,
            cpu_period: 100_000,
            memory_bytes: 512 * 1024 * 1024,
            memory_swap_bytes: 512 * 1024 * 1024,
            pids_limit: 100,
            read_only_rootfs: true,
            cap_drop: vec![],
            cap_add: vec![],
            security_opt: vec![],
            mounts: vec![],
            ports: vec![],
            network_name: "net".into(),
        }
    }

    #[tokio::test]
    async fn cpu_percent_guards_zero_deltas() {
        let raw = RawStats::default();
        let sample = derive(&raw);
        assert_eq!(sample.cpu_percent, 0.0);
    }

    #[tokio::test]
    async fn collect_caches_latest_sample() {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let container_manager = ContainerManager::new(runtime.clone(), "aicli", Duration::from_secs(10));
        let container = container_manager.create_workspace_container(CreateWorkspaceContainerRequest {
                workspace_id: "ws-1".into(),
                workspace_name: "demo".into(),
                image: "debian".into(),
                command: vec![],
                env: Map::new(),
                isolation: isolation(),
            }).await.unwrap();

        let collector = StatsCollector::new(runtime);
        assert!(collector.cached(&container.id).is_none());
        let sample = collector.collect(&container.id).await.unwrap();
        assert!(sample.cpu_percent > 0.0);
        assert!(collector.cached(&container.id).is_some());
    }

    #[tokio::test]
    async fn collect_all_skips_failures() {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let collector = StatsCollector::new(runtime);
        let samples = collector.collect_all(&["does-not-exist".to_string()]).await;
        assert!(samples.is_empty());
    }
}
