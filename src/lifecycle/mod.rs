//! C4 — Lifecycle Manager.
//!
//! Subscribes once, at construction, to the runtime's container event
//! stream filtered to `<prefix>.managed=true`. Translates each raw event
//! into a [`ContainerEvent`], resolving `workspace_id` from the actor's
//! label map — events without it are dropped — and fans it out
//! to every subscriber of that workspace.
//!
//! Grounded on `events/bus.rs`'s `EventBus` (`tokio::broadcast`,
//! per-subscriber re-subscribe on clone) narrowed to a per-workspace-keyed
//! fan-out, and on `environment/docker/power.rs`'s `wait_for_container_exit`
//! pattern for [`LifecycleManager::wait_for_container_state`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::container_manager::{ContainerManager, ContainerState};
use crate::error::{OrchestratorError, Result};
use crate::runtime::RuntimeClient;

/// A workspace lifecycle signal, translated from a [`crate::runtime::RawEvent`].
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub container_id: String,
    pub workspace_id: String,
    pub event_type: ContainerEventType,
    pub state: ContainerState,
    pub timestamp: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEventType {
    Create,
    Start,
    Stop,
    Restart,
    Destroy,
    Die,
    Pause,
    Unpause,
    Health,
    Other,
}

impl From<&str> for ContainerEventType {
    fn from(action: &str) -> Self {
        match action {
            "create" => ContainerEventType::Create,
            "start" => ContainerEventType::Start,
            "stop" => ContainerEventType::Stop,
            "restart" => ContainerEventType::Restart,
            "destroy" => ContainerEventType::Destroy,
            "die" => ContainerEventType::Die,
            "pause" => ContainerEventType::Pause,
            "unpause" => ContainerEventType::Unpause,
            a if a.starts_with("health_status") => ContainerEventType::Health,
            _ => ContainerEventType::Other,
        }
    }
}

/// Maps a raw runtime action string to a [`ContainerState`] (status table).
fn status_for_action(action: &str) -> ContainerState {
    match action {
        "create" => ContainerState::Created,
        "start" | "unpause" => ContainerState::Running,
        "stop" | "die" => ContainerState::Exited,
        "pause" => ContainerState::Paused,
        "destroy" => ContainerState::Removing,
        "restart" => ContainerState::Restarting,
        _ => ContainerState::Dead,
    }
}

/// Capacity of each per-workspace broadcast channel: a full
/// channel drops the oldest event to admit the newest. `tokio::broadcast`
/// gives this natively — a lagging receiver's next `recv` resumes at the
/// newest retained message instead of blocking the sender.
const WORKSPACE_CHANNEL_CAPACITY: usize = 100;

/// Bounded per-container history kept for [`LifecycleManager::get_container_history`].
const HISTORY_CAPACITY: usize = 64;

struct WorkspaceChannel {
    sender: broadcast::Sender<ContainerEvent>,
    // held so the channel survives zero subscribers between events
    _receiver: broadcast::Receiver<ContainerEvent>,
}

/// Subscribes to the runtime event stream and fans events out per workspace.
pub struct LifecycleManager {
    runtime: Arc<dyn RuntimeClient>,
    container_manager: Arc<ContainerManager>,
    channels: DashMap<String, WorkspaceChannel>,
    history: DashMap<String, VecDeque<ContainerEvent>>,
    workspace_id_label: String,
    pump: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Spawns the dedicated event-consumer task ("a single dedicated
    /// event-consumer task").
    pub fn start(
        runtime: Arc<dyn RuntimeClient>,
        container_manager: Arc<ContainerManager>,
        label_prefix: &str,
    ) -> Arc<Self> {
        let workspace_id_label = format!("{label_prefix}.workspace.id");
        let managed_label = format!("{label_prefix}.managed");

        let manager = Arc::new(Self {
            runtime,
            container_manager,
            channels: DashMap::new(),
            history: DashMap::new(),
            workspace_id_label,
            pump: std::sync::Mutex::new(None),
        });

        let pump_manager = manager.clone();
        let handle = tokio::spawn(async move {
            pump_manager.run_pump(managed_label).await;
        });
        *manager.pump.lock().unwrap() = Some(handle);
        manager
    }

    async fn run_pump(self: Arc<Self>, managed_label: String) {
        loop {
            let mut events = self.runtime.container_events(Some((managed_label.clone(), "true".to_string())));

            loop {
                match events.recv().await {
                    Some(Ok(raw)) => {
                        if raw.kind != "container" {
                            continue;
                        }
                        let Some(workspace_id) = raw.actor_attributes.get(&self.workspace_id_label).cloned()
                        else {
                            continue; // events without the label are dropped 
                        };

                        let event = ContainerEvent {
                            container_id: raw.actor_id,
                            workspace_id: workspace_id.clone(),
                            event_type: ContainerEventType::from(raw.action.as_str()),
                            state: status_for_action(&raw.action),
                            timestamp: raw.timestamp,
                            attributes: raw.actor_attributes,
                        };

                        self.record_history(&event);
                        self.publish(&workspace_id, event);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "container event stream error; reconnecting in 5s");
                        break;
                    }
                    None => {
                        warn!("container event stream closed; reconnecting in 5s");
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    fn record_history(&self, event: &ContainerEvent) {
        let mut entry = self.history.entry(event.container_id.clone()).or_insert_with(VecDeque::new());
        if entry.len() >= HISTORY_CAPACITY {
            entry.pop_front();
        }
        entry.push_back(event.clone());
    }

    fn publish(&self, workspace_id: &str, event: ContainerEvent) {
        let channel = self.channels.entry(workspace_id.to_string()).or_insert_with(|| {
                let (sender, receiver) = broadcast::channel(WORKSPACE_CHANNEL_CAPACITY);
                WorkspaceChannel {
                    sender,
                    _receiver: receiver,
                }
            });
        // A send error just means there are no subscribers right now; the
        // event is still recorded in `history` ("delivered to every
        // subscriber", not "persisted" — best-effort delivery is the contract).
        let _ = channel.sender.send(event);
    }

    /// Subscribes to every event for `workspace_id`.
    pub fn subscribe(&self, workspace_id: &str) -> broadcast::Receiver<ContainerEvent> {
        self.channels.entry(workspace_id.to_string()).or_insert_with(|| {
                let (sender, receiver) = broadcast::channel(WORKSPACE_CHANNEL_CAPACITY);
                WorkspaceChannel {
                    sender,
                    _receiver: receiver,
                }
            }).sender.subscribe()
    }

    /// Waits until `container_id` reaches `target_state`, or `timeout` elapses.
    pub async fn wait_for_container_state(
        &self,
        container_id: &str,
        target_state: ContainerState,
        timeout: Duration,
    ) -> Result<()> {
        let current = self.container_manager.inspect_container(container_id).await?;
        if current.state == target_state {
            return Ok(());
        }

        let mut receiver = self.subscribe(&current.workspace_id);
        tokio::time::timeout(timeout, async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.container_id == container_id && event.state == target_state => {
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "lifecycle subscriber lagged while waiting");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(OrchestratorError::connection(
                            "lifecycle event channel closed while waiting",
                        ));
                    }
                }
            }
        }).await.map_err(|_| OrchestratorError::timeout(format!("timed out waiting for {container_id} to reach {target_state:?}")))?
    }

    /// Returns the bounded in-memory event history recorded for `container_id`
    /// since `since`. Synthesized from the live stream rather than a
    /// historical runtime query, since [`RuntimeClient`] exposes no such
    /// endpoint — the ring buffer this module already keeps for dispatch
    /// doubles as the backing store.
    pub fn get_container_history(&self, container_id: &str, since: DateTime<Utc>) -> Vec<ContainerEvent> {
        self.history.get(container_id).map(|entries| {
                entries.iter().filter(|e| e.timestamp >= since).cloned().collect()
            }).unwrap_or_default()
    }

    /// Stops the dedicated event-consumer task. Called by the factory (C10) on shutdown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::container_manager::CreateWorkspaceContainerRequest;
    use crate::isolation::IsolationConfig;
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
    async fn events_are_delivered_only_to_matching_workspace() {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let container_manager = Arc::new(ContainerManager::new(
            runtime.clone(),
            "aicli",
            Duration::from_secs(10),
        ));
        let lifecycle = LifecycleManager::start(runtime.clone(), container_manager.clone(), "aicli");

        let mut sub = lifecycle.subscribe("ws-1");

        let container = container_manager.create_workspace_container(CreateWorkspaceContainerRequest {
                workspace_id: "ws-1".into(),
                workspace_name: "demo".into(),
                image: "debian".into(),
                command: vec![],
                env: Map::new(),
                isolation: isolation(),
            }).await.unwrap();
        container_manager.start_container(&container.id).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.workspace_id, "ws-1");

        lifecycle.shutdown();
    }

    #[tokio::test]
    async fn wait_for_container_state_returns_immediately_if_already_there() {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let container_manager = Arc::new(ContainerManager::new(
            runtime.clone(),
            "aicli",
            Duration::from_secs(10),
        ));
        let lifecycle = LifecycleManager::start(runtime.clone(), container_manager.clone(), "aicli");

        let container = container_manager.create_workspace_container(CreateWorkspaceContainerRequest {
                workspace_id: "ws-2".into(),
                workspace_name: "demo".into(),
                image: "debian".into(),
                command: vec![],
                env: Map::new(),
                isolation: isolation(),
            }).await.unwrap();

        lifecycle.wait_for_container_state(&container.id, ContainerState::Created, Duration::from_secs(1)).await.unwrap();

        lifecycle.shutdown();
    }
}
