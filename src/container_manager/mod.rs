//! C3 — Container Manager.
//!
//! CRUD over workspace containers using C1 ([`RuntimeClient`]) and C2
//! ([`IsolationBuilder`]). Enforces the name/label conventions that make
//! label-keyed discovery a strict contract : every container this
//! module creates carries `<prefix>.managed=true` and
//! `<prefix>.workspace.id=<id>`, and [`list_workspace_containers`] is the
//! *only* way the crate enumerates a workspace's containers.
//!
//! Grounded on `environment/docker/container.rs` (HostConfig/Config
//! assembly, name-collision handling) and `docker/service.rs` (CRUD
//! wrappers, 404 mapping), generalized from a single-server-per-environment
//! model to one-container-per-workspace driven by labels instead of a fixed
//! name template.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::isolation::IsolationConfig;
use crate::runtime::{ContainerSpec, MountSpec, PortSpec, RuntimeClient, RuntimeContainer};

/// Runtime lifecycle state of a [`WorkspaceContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Removing,
    Dead,
}

impl ContainerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Dead => "dead",
        }
    }
}

impl From<&str> for ContainerState {
    fn from(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            _ => ContainerState::Dead,
        }
    }
}

/// The internal shape a [`RuntimeContainer`] is projected into.
#[derive(Debug, Clone)]
pub struct WorkspaceContainer {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub ports: Vec<PortSpec>,
    pub mounts: Vec<MountSpec>,
    pub labels: HashMap<String, String>,
}

/// Input to [`ContainerManager::create_workspace_container`].
#[derive(Debug, Clone)]
pub struct CreateWorkspaceContainerRequest {
    pub workspace_id: String,
    pub workspace_name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Caller-supplied environment; overrides `WORKSPACE_ID`/`WORKSPACE_NAME`
    /// only if it redeclares those keys ("caller vars override
    /// defaults by later insertion").
    pub env: HashMap<String, String>,
    pub isolation: IsolationConfig,
}

fn project(raw: RuntimeContainer, workspace_id: String) -> WorkspaceContainer {
    WorkspaceContainer {
        id: raw.id,
        name: raw.name,
        workspace_id,
        state: ContainerState::from(raw.status.as_str()),
        created_at: raw.created_at,
        started_at: raw.started_at,
        finished_at: raw.finished_at,
        exit_code: raw.exit_code,
        ports: raw.ports,
        mounts: raw.mounts,
        labels: raw.labels,
    }
}

/// CRUD over workspace containers.
pub struct ContainerManager {
    runtime: Arc<dyn RuntimeClient>,
    label_prefix: String,
    stop_timeout: Duration,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn RuntimeClient>, label_prefix: impl Into<String>, stop_timeout: Duration) -> Self {
        Self {
            runtime,
            label_prefix: label_prefix.into(),
            stop_timeout,
        }
    }

    /// Deterministic container name for a workspace : `<prefix>-workspace-<id>`.
    pub fn container_name(&self, workspace_id: &str) -> String {
        format!("{}-workspace-{}", self.label_prefix, workspace_id)
    }

    fn managed_label(&self) -> String {
        format!("{}.managed", self.label_prefix)
    }

    fn workspace_id_label(&self) -> String {
        format!("{}.workspace.id", self.label_prefix)
    }

    fn labels(&self, workspace_id: &str, workspace_name: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(self.managed_label(), "true".to_string());
        labels.insert(self.workspace_id_label(), workspace_id.to_string());
        labels.insert(
            format!("{}.workspace.name", self.label_prefix),
            workspace_name.to_string(),
        );
        labels.insert(format!("{}.type", self.label_prefix), "workspace".to_string());
        labels.insert(format!("{}.created", self.label_prefix), Utc::now().to_rfc3339());
        labels
    }

    /// Creates a workspace container. Never starts it; callers that
    /// want a running container issue `start` afterward (the task executor's
    /// `create` task chains both internally).
    ///
    /// Before creating, removes any container already bearing this
    /// workspace's deterministic name ("name collisions are resolved by
    /// removing the older one before creation").
    pub async fn create_workspace_container(
        &self,
        req: CreateWorkspaceContainerRequest,
    ) -> Result<WorkspaceContainer> {
        let name = self.container_name(&req.workspace_id);

        let existing = self.runtime.container_list(HashMap::from([(self.workspace_id_label(), req.workspace_id.clone())])).await?;
        for stale in existing {
            warn!(workspace_id = %req.workspace_id, container_id = %stale.id, "removing stale container before create");
            let _ = self.runtime.container_remove(&stale.id, true).await;
        }

        let mut env: Vec<String> = vec![
            format!("WORKSPACE_ID={}", req.workspace_id),
            format!("WORKSPACE_NAME={}", req.workspace_name),
        ];
        // Caller-supplied vars override defaults by later insertion: a
        // duplicate key earlier in the vec is shadowed because the runtime
        // applies the last occurrence of a given key.
        for (k, v) in &req.env {
            env.push(format!("{k}={v}"));
        }

        let spec = ContainerSpec {
            name: name.clone(),
            image: req.image,
            command: req.command,
            env,
            working_dir: Some("/workspace".to_string()),
            labels: self.labels(&req.workspace_id, &req.workspace_name),
            cpu_quota: req.isolation.cpu_quota,
            cpu_period: req.isolation.cpu_period,
            memory_bytes: req.isolation.memory_bytes,
            memory_swap_bytes: req.isolation.memory_swap_bytes,
            pids_limit: req.isolation.pids_limit,
            read_only_rootfs: req.isolation.read_only_rootfs,
            cap_drop: req.isolation.cap_drop,
            cap_add: req.isolation.cap_add,
            security_opt: req.isolation.security_opt,
            mounts: req.isolation.mounts,
            ports: req.isolation.ports,
            network_name: Some(req.isolation.network_name),
            restart_policy: "unless-stopped".to_string(),
        };

        let id = self.runtime.container_create(spec).await?;
        info!(workspace_id = %req.workspace_id, container_id = %id, "created workspace container");

        // Defused on success; if the post-create inspect fails we'd
        // otherwise leak an untracked container the next `list` can't see
        // an error for (it's already past creation).
        let runtime = self.runtime.clone();
        let cleanup_id = id.clone();
        let guard = scopeguard::guard((), move |_| {
            let runtime = runtime.clone();
            let id = cleanup_id.clone();
            tokio::spawn(async move {
                let _ = runtime.container_remove(&id, true).await;
            });
        });

        let container = self.inspect_container(&id).await?;
        scopeguard::ScopeGuard::into_inner(guard);
        Ok(container)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.runtime.container_start(id).await
    }

    pub async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        self.runtime.container_stop(id, timeout).await
    }

    pub async fn stop_container_default_timeout(&self, id: &str) -> Result<()> {
        self.stop_container(id, self.stop_timeout).await
    }

    pub async fn restart_container(&self, id: &str, timeout: Duration) -> Result<()> {
        self.runtime.container_restart(id, timeout).await
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.runtime.container_remove(id, force).await
    }

    pub async fn inspect_container(&self, id: &str) -> Result<WorkspaceContainer> {
        let raw = self.runtime.container_inspect(id).await?;
        let workspace_id = raw.labels.get(&self.workspace_id_label()).cloned().unwrap_or_default();
        Ok(project(raw, workspace_id))
    }

    /// Lists a workspace's containers by label — the sole discovery key.
    /// Never enumerates by name or any other criterion.
    pub async fn list_workspace_containers(&self, workspace_id: &str) -> Result<Vec<WorkspaceContainer>> {
        let raw = self.runtime.container_list(HashMap::from([(self.workspace_id_label(), workspace_id.to_string())])).await?;
        Ok(raw.into_iter().map(|c| project(c, workspace_id.to_string())).collect())
    }

    /// Stops and removes every container belonging to `workspace_id`.
    ///
    /// `force=false`: the first stop/remove error aborts and is surfaced.
    /// `force=true`: errors are swallowed and iteration continues, so a
    /// partially-broken workspace can still be fully reclaimed.
    pub async fn cleanup_workspace(&self, workspace_id: &str, force: bool) -> Result<()> {
        let containers = self.list_workspace_containers(workspace_id).await?;
        for container in containers {
            if container.state == ContainerState::Running {
                let result = self.stop_container_default_timeout(&container.id).await;
                if let Err(e) = result {
                    if force {
                        warn!(container_id = %container.id, error = %e, "ignoring stop failure during forced cleanup");
                    } else {
                        return Err(e);
                    }
                }
            }

            let result = self.remove_container(&container.id, true).await;
            if let Err(e) = result {
                if force {
                    warn!(container_id = %container.id, error = %e, "ignoring remove failure during forced cleanup");
                } else {
                    return Err(e);
                }
            } else {
                debug!(container_id = %container.id, "removed workspace container");
            }
        }
        Ok(())
    }
}

/// Maps a raw runtime error to [`ErrorKind::ContainerNotFound`] when it is
/// already classified as such, otherwise returns it unchanged. Kept as a
/// thin helper so call sites read declaratively ("never returns runtime
/// errors directly").
pub fn is_not_found(err: &OrchestratorError) -> bool {
    err.kind() == ErrorKind::ContainerNotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntimeClient;
    use std::time::Duration;

    fn manager() -> ContainerManager {
        ContainerManager::new(Arc::new(FakeRuntimeClient::new()), "aicli", Duration::from_secs(10))
    }

    fn isolation() -> IsolationConfig {
        IsolationConfig {
            cpu_quota: 100_000,
            cpu_period: 100_000,
            memory_bytes: 512 * 1024 * 1024,
            memory_swap_bytes: 512 * 1024 * 1024,
            pids_limit: 100,
            read_only_rootfs: true,
            cap_drop: vec!["ALL".into()],
            cap_add: vec!["CHOWN".into()],
            security_opt: vec!["no-new-privileges:true".into()],
            mounts: vec![],
            ports: vec![],
            network_name: "workspace-net-1".into(),
        }
    }

    fn request(workspace_id: &str) -> CreateWorkspaceContainerRequest {
        CreateWorkspaceContainerRequest {
            workspace_id: workspace_id.to_string(),
            workspace_name: "demo".to_string(),
            image: "debian:bookworm-slim".to_string(),
            command: vec!["/bin/sh".to_string()],
            env: HashMap::new(),
            isolation: isolation(),
        }
    }

    #[tokio::test]
    async fn create_carries_mandatory_labels() {
        let manager = manager();
        let container = manager.create_workspace_container(request("ws-1")).await.unwrap();
        assert_eq!(container.labels.get("aicli.managed"), Some(&"true".to_string()));
        assert_eq!(container.labels.get("aicli.workspace.id"), Some(&"ws-1".to_string()));
        assert_eq!(container.state, ContainerState::Created);
    }

    #[tokio::test]
    async fn second_create_replaces_first() {
        let manager = manager();
        let first = manager.create_workspace_container(request("ws-1")).await.unwrap();
        let second = manager.create_workspace_container(request("ws-1")).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(manager.inspect_container(&first.id).await.is_err());

        let listed = manager.list_workspace_containers("ws-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second.id);
    }

    #[tokio::test]
    async fn list_is_label_scoped() {
        let manager = manager();
        manager.create_workspace_container(request("ws-1")).await.unwrap();
        manager.create_workspace_container(request("ws-2")).await.unwrap();

        assert_eq!(manager.list_workspace_containers("ws-1").await.unwrap().len(), 1);
        assert_eq!(manager.list_workspace_containers("ws-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_stops_and_removes_running_containers() {
        let manager = manager();
        let container = manager.create_workspace_container(request("ws-1")).await.unwrap();
        manager.start_container(&container.id).await.unwrap();

        manager.cleanup_workspace("ws-1", false).await.unwrap();
        assert!(manager.list_workspace_containers("ws-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_nonexistent_container_returns_not_found() {
        let manager = manager();
        let err = manager.remove_container("does-not-exist", false).await.unwrap_err();
        assert!(is_not_found(&err));
    }
}
