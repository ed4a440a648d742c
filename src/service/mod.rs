//! C7 — Workspace Service.
//!
//! Coordinates C3/C4/C6 and the storage collaborator; implements the
//! public verbs and enforces validation and ownership before any task is
//! enqueued.
//!
//! Grounded on `server/server.rs`'s `Server` struct as the per-entity
//! coordinator pattern (owns sub-collaborators, exposes verb methods that
//! sequence them), and on its `sync_status_to_panel` method for the
//! reconciliation verb's derivation logic — here folded into C6's `sync`
//! task rather than duplicated in the service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::container_manager::ContainerManager;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::isolation::IsolationOverrides;
use crate::stats::{AggregatedStats, StatsCollector};
use crate::storage::{FieldUpdate, FieldValue, Page, WorkspaceStore};
use crate::task_executor::{CreateTaskData, TaskExecutor, WorkspaceTask, WorkspaceTaskKind};
use crate::workspace::{Workspace, WorkspaceStatus};

const MAX_NAME_LEN: usize = 100;
const MAX_WORKSPACES_PER_OWNER: u64 = 50;
const CLAUDE_KEY_PREFIX: &str = "sk-";
const CLAUDE_KEY_MIN_LEN: usize = 16;
const DISALLOWED_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const RESERVED_NAMES: &[&str] = &[
    "admin", "root", "system", "administrator", "api", "null", "undefined", "config",
];

/// Input to [`WorkspaceService::create_workspace`].
#[derive(Debug, Clone)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub owner_id: String,
    pub project_path: String,
    pub claude_key: Option<String>,
}

/// Caller-supplied field changes for [`WorkspaceService::update_workspace`].
/// Only fields set to `Some` are validated and applied ("re-validates
/// only supplied fields").
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkspaceRequest {
    pub name: Option<String>,
    pub claude_key: Option<Option<String>>,
}

/// Coordinates C3/C4/C6 and storage; implements the public verbs.
pub struct WorkspaceService {
    store: Arc<dyn WorkspaceStore>,
    task_executor: Arc<TaskExecutor>,
    container_manager: Arc<ContainerManager>,
    stats: Arc<StatsCollector>,
    create_timeout: Duration,
    task_timeout: Duration,
}

impl WorkspaceService {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        task_executor: Arc<TaskExecutor>,
        container_manager: Arc<ContainerManager>,
        stats: Arc<StatsCollector>,
        create_timeout: Duration,
        task_timeout: Duration,
    ) -> Self {
        Self {
            store,
            task_executor,
            container_manager,
            stats,
            create_timeout,
            task_timeout,
        }
    }

    /// Validates, persists, and enqueues the `create` task.
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        let name = validate_name(&req.name)?;
        validate_project_path(&req.project_path)?;
        if let Some(key) = &req.claude_key {
            validate_claude_key(key)?;
        }

        let page = self.store.get_by_owner_id(&req.owner_id, 1, MAX_WORKSPACES_PER_OWNER + 1).await?;
        if page.total >= MAX_WORKSPACES_PER_OWNER {
            return Err(OrchestratorError::validation(format!(
                "owner {} already has the maximum of {MAX_WORKSPACES_PER_OWNER} workspaces",
                req.owner_id
            )));
        }

        if self.store.exists_by_name(&req.owner_id, &name).await? {
            return Err(OrchestratorError::conflict(format!(
                "workspace named {name} already exists for this owner"
            )));
        }

        let id = Uuid::new_v4().to_string();
        let workspace = Workspace::new(id.clone(), name, req.owner_id, req.project_path, req.claude_key);
        let created = self.store.create(workspace).await?;

        let task = WorkspaceTask::new(
            WorkspaceTaskKind::Create(CreateTaskData::default()),
            id.clone(),
            self.create_timeout,
        );
        self.task_executor.submit_and_wait(task).await?;

        info!(workspace_id = %id, owner_id = %created.owner_id, "workspace created");
        self.fetch_owned(&id, &created.owner_id).await
    }

    pub async fn get_workspace(&self, id: &str, owner_id: &str) -> Result<Workspace> {
        self.fetch_owned(id, owner_id).await
    }

    pub async fn update_workspace(&self, id: &str, owner_id: &str, req: UpdateWorkspaceRequest) -> Result<Workspace> {
        let existing = self.fetch_owned(id, owner_id).await?;

        let mut update: FieldUpdate = HashMap::new();
        if let Some(name) = &req.name {
            let name = validate_name(name)?;
            if name != existing.name && self.store.exists_by_name(owner_id, &name).await? {
                return Err(OrchestratorError::conflict(format!(
                    "workspace named {name} already exists for this owner"
                )));
            }
            update.insert("name", FieldValue::Name(name));
        }
        if let Some(claude_key) = &req.claude_key {
            if let Some(key) = claude_key {
                validate_claude_key(key)?;
            }
            update.insert("claude_key", FieldValue::ClaudeKey(claude_key.clone()));
        }

        if update.is_empty() {
            return Ok(existing);
        }

        self.store.update(id, update).await
    }

    /// Soft-deletes the workspace after runtime cleanup. Refused
    /// while `active_tasks > 0` (`resource_busy`).
    pub async fn delete_workspace(&self, id: &str, owner_id: &str) -> Result<()> {
        let workspace = self.fetch_owned(id, owner_id).await?;
        if workspace.active_tasks > 0 {
            return Err(OrchestratorError::state("workspace has active tasks; resource_busy"));
        }

        let task = WorkspaceTask::new(WorkspaceTaskKind::Delete, id, self.task_timeout);
        self.task_executor.submit_and_wait(task).await?;

        self.container_manager.cleanup_workspace(id, true).await?;
        self.store.delete(id).await
    }

    pub async fn list_workspaces(&self, owner_id: &str, page: u64, page_size: u64) -> Result<Page<Workspace>> {
        let mut listed = self.store.get_by_owner_id(owner_id, page, page_size).await?;
        for w in listed.items.iter_mut() {
            mask_in_place(w);
        }
        Ok(listed)
    }

    /// Activates an `inactive` workspace. Activating an `archived` workspace
    /// fails — archived is terminal.
    pub async fn activate_workspace(&self, id: &str, owner_id: &str) -> Result<Workspace> {
        let workspace = self.fetch_owned(id, owner_id).await?;
        if workspace.status == WorkspaceStatus::Archived {
            return Err(OrchestratorError::state("cannot activate an archived workspace"));
        }

        let task = WorkspaceTask::new(WorkspaceTaskKind::Start, id, self.task_timeout);
        self.task_executor.submit_and_wait(task).await?;

        let mut update: FieldUpdate = HashMap::new();
        update.insert("status", FieldValue::Status(WorkspaceStatus::Active));
        self.store.update(id, update).await
    }

    /// Deactivates a workspace. Fails with `resource_busy` while
    /// `active_tasks > 0`.
    pub async fn deactivate_workspace(&self, id: &str, owner_id: &str) -> Result<Workspace> {
        let workspace = self.fetch_owned(id, owner_id).await?;
        if workspace.active_tasks > 0 {
            return Err(OrchestratorError::state("workspace has active tasks; resource_busy"));
        }

        let task = WorkspaceTask::new(WorkspaceTaskKind::Stop, id, self.task_timeout);
        self.task_executor.submit_and_wait(task).await?;

        let mut update: FieldUpdate = HashMap::new();
        update.insert("status", FieldValue::Status(WorkspaceStatus::Inactive));
        self.store.update(id, update).await
    }

    /// Archives a workspace — a terminal transition (state machine).
    pub async fn archive_workspace(&self, id: &str, owner_id: &str) -> Result<Workspace> {
        let workspace = self.fetch_owned(id, owner_id).await?;
        if workspace.active_tasks > 0 {
            return Err(OrchestratorError::state("workspace has active tasks; resource_busy"));
        }

        let task = WorkspaceTask::new(WorkspaceTaskKind::Stop, id, self.task_timeout);
        self.task_executor.submit_and_wait(task).await?;

        let mut update: FieldUpdate = HashMap::new();
        update.insert("status", FieldValue::Status(WorkspaceStatus::Archived));
        self.store.update(id, update).await
    }

    pub async fn update_active_task_count(&self, id: &str, owner_id: &str, delta: i64) -> Result<Workspace> {
        self.fetch_owned(id, owner_id).await?;
        let mut update: FieldUpdate = HashMap::new();
        update.insert("active_tasks", FieldValue::ActiveTasksDelta(delta));
        self.store.update(id, update).await
    }

    /// Aggregated resource stats across every container the workspace owns.
    pub async fn get_workspace_stats(&self, id: &str, owner_id: &str) -> Result<AggregatedStats> {
        self.fetch_owned(id, owner_id).await?;
        let containers = self.container_manager.list_workspace_containers(id).await?;
        let ids: Vec<String> = containers.into_iter().map(|c| c.id).collect();
        let samples = self.stats.collect_all(&ids).await;
        Ok(StatsCollector::aggregate(&samples))
    }

    pub async fn get_workspace_status(&self, id: &str, owner_id: &str) -> Result<WorkspaceStatus> {
        Ok(self.fetch_owned(id, owner_id).await?.status)
    }

    /// Creates with explicit isolation overrides and image/command, used by
    /// callers that need more than the zero-value `create` task default
    /// (e.g. a CLI harness). Thin wrapper kept separate from
    /// [`create_workspace`](Self::create_workspace) so the common path stays simple.
    pub async fn create_workspace_with_overrides(
        &self,
        req: CreateWorkspaceRequest,
        image: Option<String>,
        command: Option<Vec<String>>,
        env: HashMap<String, String>,
        isolation_overrides: IsolationOverrides,
    ) -> Result<Workspace> {
        let name = validate_name(&req.name)?;
        validate_project_path(&req.project_path)?;
        if let Some(key) = &req.claude_key {
            validate_claude_key(key)?;
        }
        if self.store.exists_by_name(&req.owner_id, &name).await? {
            return Err(OrchestratorError::conflict(format!(
                "workspace named {name} already exists for this owner"
            )));
        }

        let id = Uuid::new_v4().to_string();
        let workspace = Workspace::new(id.clone(), name, req.owner_id.clone(), req.project_path, req.claude_key);
        let created = self.store.create(workspace).await?;

        let task = WorkspaceTask::new(
            WorkspaceTaskKind::Create(CreateTaskData {
                image,
                command,
                env,
                isolation_overrides,
            }),
            id.clone(),
            self.create_timeout,
        );
        self.task_executor.submit_and_wait(task).await?;

        self.fetch_owned(&id, &created.owner_id).await
    }

    /// Fetches a workspace, enforcing ownership. A mismatched owner is
    /// reported as `not_found`, never `unauthorized`, to avoid existence
    /// disclosure.
    async fn fetch_owned(&self, id: &str, owner_id: &str) -> Result<Workspace> {
        let workspace = self.store.get_by_id(id).await?.ok_or_else(|| OrchestratorError::not_found(format!("workspace {id} not found")))?;
        if workspace.owner_id != owner_id {
            return Err(OrchestratorError::not_found(format!("workspace {id} not found")));
        }
        let mut masked = workspace;
        mask_in_place(&mut masked);
        Ok(masked)
    }
}

fn mask_in_place(workspace: &mut Workspace) {
    workspace.claude_key = workspace.masked_claude_key();
}

/// Validates and trims a workspace name.
fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(OrchestratorError::validation(
            "workspace name must be 1-100 characters",
        ));
    }
    if name.chars().any(|c| DISALLOWED_NAME_CHARS.contains(&c) || c.is_control()) {
        return Err(OrchestratorError::validation(
            "workspace name contains a disallowed character",
        ));
    }
    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(OrchestratorError::validation(format!("{name} is a reserved name")));
    }
    Ok(name)
}

/// Validates that `project_path` exists, is a directory, and is writable
/// : a test file is created and removed.
fn validate_project_path(project_path: &str) -> Result<()> {
    let path = std::path::Path::new(project_path);
    if !path.is_absolute() {
        return Err(OrchestratorError::validation("project_path must be an absolute path"));
    }
    let metadata = std::fs::metadata(path).map_err(|_| OrchestratorError::validation(format!("project_path {project_path} does not exist")))?;
    if !metadata.is_dir() {
        return Err(OrchestratorError::validation(format!(
            "project_path {project_path} is not a directory"
        )));
    }

    let probe = path.join(format!(".workspace-write-probe-{}", Uuid::new_v4()));
    std::fs::write(&probe, b"").map_err(|_| {
        OrchestratorError::new(ErrorKind::Validation, format!("project_path {project_path} is not writable"))
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Validates the Claude key prefix/minimum length.
fn validate_claude_key(key: &str) -> Result<()> {
    if !key.starts_with(CLAUDE_KEY_PREFIX) || key.len() < CLAUDE_KEY_MIN_LEN {
        return Err(OrchestratorError::validation("claude_key is malformed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationDefaults;
    use crate::isolation::IsolationBuilder;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::storage::memory::InMemoryWorkspaceStore;

    fn service() -> WorkspaceService {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let container_manager = Arc::new(ContainerManager::new(runtime.clone(), "aicli", Duration::from_secs(10)));
        let isolation_builder = Arc::new(IsolationBuilder::new(IsolationDefaults::default()));
        let store: Arc<dyn WorkspaceStore> = Arc::new(InMemoryWorkspaceStore::new());
        let executor = TaskExecutor::new(
            store.clone(),
            container_manager.clone(),
            isolation_builder,
            3,
            100,
            "debian:bookworm-slim".into(),
            vec!["/bin/sh".into()],
            Duration::from_secs(10),
            Duration::from_secs(8),
        );
        let stats = Arc::new(StatsCollector::new(runtime));
        WorkspaceService::new(
            store,
            executor,
            container_manager,
            stats,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    fn tmp_project_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn create_rejects_reserved_name() {
        let svc = service();
        let dir = tmp_project_dir();
        let err = svc.create_workspace(CreateWorkspaceRequest {
                name: "admin".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_rejects_slashed_name() {
        let svc = service();
        let dir = tmp_project_dir();
        let err = svc.create_workspace(CreateWorkspaceRequest {
                name: "ok/slashed".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_rejects_missing_project_path() {
        let svc = service();
        let err = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: "/definitely/does/not/exist/anywhere".into(),
                claude_key: None,
            }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_then_second_with_same_owner_name_conflicts() {
        let svc = service();
        let dir = tmp_project_dir();
        let path = dir.path().to_string_lossy().to_string();

        svc.create_workspace(CreateWorkspaceRequest {
            name: "demo".into(),
            owner_id: "owner-a".into(),
            project_path: path.clone(),
            claude_key: None,
        }).await.unwrap();

        let err = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: path,
                claude_key: None,
            }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn same_name_different_owner_succeeds() {
        let svc = service();
        let dir = tmp_project_dir();
        let path = dir.path().to_string_lossy().to_string();

        svc.create_workspace(CreateWorkspaceRequest {
            name: "demo".into(),
            owner_id: "owner-a".into(),
            project_path: path.clone(),
            claude_key: None,
        }).await.unwrap();

        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-b".into(),
                project_path: path,
                claude_key: None,
            }).await.unwrap();
        assert_eq!(created.owner_id, "owner-b");
    }

    #[tokio::test]
    async fn ownership_mismatch_reports_not_found() {
        let svc = service();
        let dir = tmp_project_dir();
        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap();

        let err = svc.get_workspace(&created.id, "owner-b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerNotFound);

        let ok = svc.get_workspace(&created.id, "owner-a").await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn claude_key_is_masked_on_read() {
        let svc = service();
        let dir = tmp_project_dir();
        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: Some("sk-ant-REDACTED".into()),
            }).await.unwrap();
        let key = created.claude_key.unwrap();
        assert!(key.contains('*'));
        assert!(!key.contains("abcdefghijklmnop"));
    }

    #[tokio::test]
    async fn delete_refused_while_active_tasks_outstanding() {
        let svc = service();
        let dir = tmp_project_dir();
        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap();

        let err = svc.delete_workspace(&created.id, "owner-a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn archiving_is_terminal() {
        let svc = service();
        let dir = tmp_project_dir();
        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap();
        svc.update_active_task_count(&created.id, "owner-a", -1).await.unwrap();

        svc.archive_workspace(&created.id, "owner-a").await.unwrap();
        let err = svc.activate_workspace(&created.id, "owner-a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn update_workspace_persists_rename() {
        let svc = service();
        let dir = tmp_project_dir();
        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap();

        let updated = svc.update_workspace(&created.id, "owner-a", UpdateWorkspaceRequest {
                name: Some("renamed".into()),
                claude_key: None,
            }).await.unwrap();
        assert_eq!(updated.name, "renamed");

        let fetched = svc.get_workspace(&created.id, "owner-a").await.unwrap();
        assert_eq!(fetched.name, "renamed");
    }

    #[tokio::test]
    async fn update_workspace_rejects_rename_to_existing_name() {
        let svc = service();
        let dir = tmp_project_dir();
        let path = dir.path().to_string_lossy().to_string();
        svc.create_workspace(CreateWorkspaceRequest {
            name: "taken".into(),
            owner_id: "owner-a".into(),
            project_path: path.clone(),
            claude_key: None,
        }).await.unwrap();
        let created = svc.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: path,
                claude_key: None,
            }).await.unwrap();

        let err = svc.update_workspace(&created.id, "owner-a", UpdateWorkspaceRequest {
                name: Some("taken".into()),
                claude_key: None,
            }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
