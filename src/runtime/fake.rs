//! In-process fake [`RuntimeClient`] for unit tests.
//!
//! Mirrors the role the daemon's `Connection::open_in_memory()` plays for
//! its SQLite store: a same-process, no-external-dependency stand-in for
//! a collaborator that is otherwise a live network service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::error::{ErrorKind, OrchestratorError, Result};

use super::types::{
    ContainerSpec, NetworkSpec, NetworkSummary, RawEvent, RawStats, RuntimeContainer,
};
use super::RuntimeClient;

#[derive(Clone)]
struct FakeContainer {
    inner: RuntimeContainer,
    spec: ContainerSpec,
}

/// A fully in-memory runtime: containers and networks live in `DashMap`s,
/// events are fanned out over a `broadcast` channel that `container_events`
/// bridges into the `mpsc::Receiver` the trait requires.
pub struct FakeRuntimeClient {
    containers: DashMap<String, FakeContainer>,
    networks: DashMap<String, NetworkSummary>,
    events: broadcast::Sender<RawEvent>,
    next_id: AtomicU64,
    pub fail_ping: std::sync::atomic::AtomicBool,
}

impl Default for FakeRuntimeClient {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            containers: DashMap::new(),
            networks: DashMap::new(),
            events,
            next_id: AtomicU64::new(1),
            fail_ping: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl FakeRuntimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("fake-container-{n}")
    }

    fn emit(&self, action: &str, container: &RuntimeContainer) {
        let _ = self.events.send(RawEvent {
            kind: "container".to_string(),
            action: action.to_string(),
            actor_id: container.id.clone(),
            actor_attributes: container.labels.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Test helper: force a container into a given status without going
    /// through the normal start/stop path, to simulate out-of-band runtime
    /// transitions (e.g. an OOM kill).
    pub fn force_status(&self, id: &str, status: &str) {
        if let Some(mut entry) = self.containers.get_mut(id) {
            entry.inner.status = status.to_string();
        }
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntimeClient {
    async fn ping(&self) -> Result<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(OrchestratorError::connection("fake daemon unreachable"));
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        Ok("fake/1.0".to_string())
    }

    async fn network_list(&self, _label_filters: HashMap<String, String>) -> Result<Vec<NetworkSummary>> {
        Ok(self.networks.iter().map(|e| e.value().clone()).collect())
    }

    async fn network_create(&self, spec: NetworkSpec) -> Result<String> {
        let id = format!("fake-network-{}", spec.name);
        self.networks.insert(
            spec.name.clone(),
            NetworkSummary {
                id: id.clone(),
                name: spec.name,
                driver: spec.driver,
                labels: spec.labels,
            },
        );
        Ok(id)
    }

    async fn network_inspect(&self, name: &str) -> Result<NetworkSummary> {
        self.networks.get(name).map(|e| e.value().clone()).ok_or_else(|| OrchestratorError::not_found(format!("network {name} not found")))
    }

    async fn network_remove(&self, name: &str) -> Result<()> {
        self.networks.remove(name);
        Ok(())
    }

    async fn container_create(&self, spec: ContainerSpec) -> Result<String> {
        // Name collisions: the fake mirrors the real runtime's behavior of
        // allowing duplicate names to 409; C3 is responsible for removing
        // the collider first, same contract as the live client.
        if self.containers.iter().any(|e| e.value().inner.name == spec.name) {
            return Err(OrchestratorError::conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let id = self.next_id();
        let runtime = RuntimeContainer {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: "created".to_string(),
            labels: spec.labels.clone(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            ports: spec.ports.clone(),
            mounts: spec.mounts.clone(),
            health_status: None,
        };

        self.emit("create", &runtime);
        self.containers.insert(
            id.clone(),
            FakeContainer {
                inner: runtime,
                spec,
            },
        );
        Ok(id)
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        let mut entry = self.containers.get_mut(id).ok_or_else(|| OrchestratorError::not_found(format!("container {id} not found")))?;
        entry.inner.status = "running".to_string();
        entry.inner.started_at = Some(Utc::now());
        let snapshot = entry.inner.clone();
        drop(entry);
        self.emit("start", &snapshot);
        Ok(())
    }

    async fn container_stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut entry = self.containers.get_mut(id).ok_or_else(|| OrchestratorError::not_found(format!("container {id} not found")))?;
        entry.inner.status = "exited".to_string();
        entry.inner.finished_at = Some(Utc::now());
        entry.inner.exit_code = Some(0);
        let snapshot = entry.inner.clone();
        drop(entry);
        self.emit("die", &snapshot);
        Ok(())
    }

    async fn container_restart(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut entry = self.containers.get_mut(id).ok_or_else(|| OrchestratorError::not_found(format!("container {id} not found")))?;
        entry.inner.status = "running".to_string();
        let snapshot = entry.inner.clone();
        drop(entry);
        self.emit("restart", &snapshot);
        Ok(())
    }

    async fn container_remove(&self, id: &str, force: bool) -> Result<()> {
        match self.containers.get(id).map(|e| e.inner.clone()) {
            Some(container) => {
                if !force && container.status == "running" {
                    return Err(OrchestratorError::new(
                        ErrorKind::Conflict,
                        "container is running",
                    ));
                }
                self.containers.remove(id);
                self.emit("destroy", &container);
                Ok(())
            }
            None => Err(OrchestratorError::not_found(format!("container {id} not found"))),
        }
    }

    async fn container_inspect(&self, id: &str) -> Result<RuntimeContainer> {
        self.containers.get(id).map(|e| e.inner.clone()).ok_or_else(|| OrchestratorError::not_found(format!("container {id} not found")))
    }

    async fn container_list(
        &self,
        label_filters: HashMap<String, String>,
    ) -> Result<Vec<RuntimeContainer>> {
        Ok(self.containers.iter().map(|e| e.value().inner.clone()).filter(|c| {
                label_filters.iter().all(|(k, v)| c.labels.get(k).map(|lv| lv == v).unwrap_or(false))
            }).collect())
    }

    async fn container_stats(&self, id: &str) -> Result<RawStats> {
        self.containers.get(id).map(|_| RawStats {
                cpu_total_usage: 200_000_000,
                cpu_system_usage: 1_000_000_000,
                prev_cpu_total_usage: 100_000_000,
                prev_cpu_system_usage: 500_000_000,
                online_cpus: 4,
                memory_usage: 100 * 1024 * 1024,
                memory_limit: 512 * 1024 * 1024,
                memory_cache: 10 * 1024 * 1024,
                rx_bytes: 1000,
                tx_bytes: 2000,
                block_read: 0,
                block_write: 0,
                pids: 3,
            }).ok_or_else(|| OrchestratorError::not_found(format!("container {id} not found")))
    }

    fn container_events(&self, label_filter: Option<(String, String)>) -> mpsc::Receiver<Result<RawEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let mut events = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some((key, value)) = &label_filter {
                            if event.actor_attributes.get(key) != Some(value) {
                                continue;
                            }
                        }
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_start_stop_round_trips() {
        let client = FakeRuntimeClient::new();
        let id = client.container_create(ContainerSpec {
                name: "t1".into(),
                image: "debian".into(),
                command: vec![],
                env: vec![],
                working_dir: None,
                labels: HashMap::new(),
                cpu_quota: 100000,
                cpu_period: 100000,
                memory_bytes: 512 * 1024 * 1024,
                memory_swap_bytes: 512 * 1024 * 1024,
                pids_limit: 100,
                read_only_rootfs: true,
                cap_drop: vec!["ALL".into()],
                cap_add: vec!["CHOWN".into()],
                security_opt: vec!["no-new-privileges:true".into()],
                mounts: vec![],
                ports: vec![],
                network_name: None,
                restart_policy: "unless-stopped".into(),
            }).await.unwrap();

        client.container_start(&id).await.unwrap();
        let inspected = client.container_inspect(&id).await.unwrap();
        assert_eq!(inspected.status, "running");

        client.container_stop(&id, Duration::from_secs(5)).await.unwrap();
        let inspected = client.container_inspect(&id).await.unwrap();
        assert_eq!(inspected.status, "exited");
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let client = FakeRuntimeClient::new();
        let spec = |name: &str| ContainerSpec {
            name: name.into(),
            image: "debian".into(),
            command: vec![],
            env: vec![],
            working_dir: None,
            labels: HashMap::new(),
            cpu_quota: 100000,
            cpu_period: 100000,
            memory_bytes: 512 * 1024 * 1024,
            memory_swap_bytes: 512 * 1024 * 1024,
            pids_limit: 100,
            read_only_rootfs: true,
            cap_drop: vec![],
            cap_add: vec![],
            security_opt: vec![],
            mounts: vec![],
            ports: vec![],
            network_name: None,
            restart_policy: "unless-stopped".into(),
        };

        client.container_create(spec("dup")).await.unwrap();
        let err = client.container_create(spec("dup")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
