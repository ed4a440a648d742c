//! C6 — Task Executor.
//!
//! A bounded worker pool that consumes [`WorkspaceTask`]s and reconciles
//! storage state with runtime state. Polymorphic dispatch is
//! modeled as a tagged union of task kinds (`WorkspaceTaskKind`) matched
//! exhaustively in one `execute` function — a function table over task
//! kinds, not a class hierarchy.
//!
//! Grounded on `server/manager.rs::initialize()`'s `Semaphore`-bounded fan-out
//! for worker-pool sizing, and `server/power.rs`'s `PowerAction` enum for the
//! tagged-union dispatch idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::container_manager::{ContainerManager, ContainerState, CreateWorkspaceContainerRequest};
use crate::error::{OrchestratorError, Result};
use crate::isolation::{IsolationBuilder, IsolationOverrides};
use crate::storage::{FieldUpdate, FieldValue, WorkspaceStore};
use crate::workspace::WorkspaceStatus;

/// Per-task payload, shaped by `WorkspaceTask::kind`.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskData {
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub isolation_overrides: IsolationOverrides,
}

#[derive(Debug, Clone)]
pub enum WorkspaceTaskKind {
    Create(CreateTaskData),
    Start,
    Stop,
    Restart,
    Delete,
    Sync,
}

impl WorkspaceTaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkspaceTaskKind::Create(_) => "create",
            WorkspaceTaskKind::Start => "start",
            WorkspaceTaskKind::Stop => "stop",
            WorkspaceTaskKind::Restart => "restart",
            WorkspaceTaskKind::Delete => "delete",
            WorkspaceTaskKind::Sync => "sync",
        }
    }
}

/// A queued unit of work. A completed/cancelled task never re-enters
/// the queue — the executor consumes it exactly once.
pub struct WorkspaceTask {
    pub id: String,
    pub kind: WorkspaceTaskKind,
    pub workspace_id: String,
    pub timeout: Duration,
    pub context: CancellationToken,
    /// Invoked with the final error (`None` on success) once the task
    /// finishes, so a synchronous-looking public verb can await it.
    pub completion: Option<oneshot::Sender<Result<()>>>,
}

impl WorkspaceTask {
    pub fn new(kind: WorkspaceTaskKind, workspace_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            workspace_id: workspace_id.into(),
            timeout,
            context: CancellationToken::new(),
            completion: None,
        }
    }
}

/// Bounded worker pool consuming [`WorkspaceTask`]s.
pub struct TaskExecutor {
    sender: mpsc::Sender<WorkspaceTask>,
    dispatcher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancellation: CancellationToken,
    sync_verb_ceiling: Duration,
}

struct Workers {
    store: Arc<dyn WorkspaceStore>,
    container_manager: Arc<ContainerManager>,
    isolation_builder: Arc<IsolationBuilder>,
    default_image: String,
    default_command: Vec<String>,
    stop_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        container_manager: Arc<ContainerManager>,
        isolation_builder: Arc<IsolationBuilder>,
        worker_count: usize,
        queue_depth: usize,
        default_image: String,
        default_command: Vec<String>,
        stop_timeout: Duration,
        sync_verb_ceiling: Duration,
    ) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<WorkspaceTask>(queue_depth);
        let cancellation = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let workers = Arc::new(Workers {
            store,
            container_manager,
            isolation_builder,
            default_image,
            default_command,
            stop_timeout,
        });

        let dispatcher_cancellation = cancellation.clone();
        let dispatcher_handle = tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    _ = dispatcher_cancellation.cancelled() => break,
                    task = receiver.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let workers = workers.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_task(workers, task).await;
                });
            }

            // Graceful shutdown: drain whatever already has a permit before returning.
            let _ = semaphore.acquire_many(u32::MAX >> 2).await;
        });

        Arc::new(Self {
            sender,
            dispatcher: std::sync::Mutex::new(Some(dispatcher_handle)),
            cancellation,
            sync_verb_ceiling,
        })
    }

    /// Enqueues `task`, blocking (FIFO) if the queue is at capacity.
    pub async fn submit(&self, task: WorkspaceTask) -> Result<()> {
        self.sender.send(task).await.map_err(|_| OrchestratorError::state("task executor is shut down"))
    }

    /// Submits `task` and awaits its completion callback up to the
    /// configured ceiling. On timeout, returns `Ok(())` — the task
    /// keeps running in the background; the caller is expected to leave the
    /// workspace in a transitional state until the next `sync`.
    pub async fn submit_and_wait(&self, mut task: WorkspaceTask) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        task.completion = Some(tx);
        self.submit(task).await?;

        match tokio::time::timeout(self.sync_verb_ceiling, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::state("task completed without reporting a result")),
            Err(_) => {
                warn!("synchronous verb ceiling elapsed; task continues in background");
                Ok(())
            }
        }
    }

    /// Cancels the dispatcher and stops accepting new tasks. In-flight tasks
    /// already past the semaphore gate run to completion and still invoke
    /// their completion callback ("draining in-flight tasks to their callback").
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        let handle = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_task(workers: Arc<Workers>, task: WorkspaceTask) {
    let workspace_id = task.workspace_id.clone();
    let kind_name = task.kind.name();
    let result = tokio::select! {
        _ = task.context.cancelled() => Err(OrchestratorError::state("task cancelled")),
        result = tokio::time::timeout(task.timeout, dispatch(&workers, &task)) => match result {
            Ok(inner) => inner,
            Err(_) => Err(OrchestratorError::timeout(format!("{kind_name} task timed out"))),
        },
    };

    if let Err(e) = &result {
        warn!(workspace_id = %workspace_id, task = kind_name, error = %e, "workspace task failed");
    } else {
        info!(workspace_id = %workspace_id, task = kind_name, "workspace task completed");
    }

    if let Some(completion) = task.completion {
        let _ = completion.send(result);
    }
}

async fn dispatch(workers: &Workers, task: &WorkspaceTask) -> Result<()> {
    match &task.kind {
        WorkspaceTaskKind::Create(data) => create(workers, &task.workspace_id, data).await,
        WorkspaceTaskKind::Start => start(workers, &task.workspace_id).await,
        WorkspaceTaskKind::Stop => stop(workers, &task.workspace_id).await,
        WorkspaceTaskKind::Restart => restart(workers, &task.workspace_id).await,
        WorkspaceTaskKind::Delete => delete(workers, &task.workspace_id).await,
        WorkspaceTaskKind::Sync => sync(workers, &task.workspace_id).await,
    }
}

async fn create(workers: &Workers, workspace_id: &str, data: &CreateTaskData) -> Result<()> {
    let workspace = workers.store.get_by_id(workspace_id).await?.ok_or_else(|| OrchestratorError::not_found(format!("workspace {workspace_id} not found")))?;

    let isolation = workers.isolation_builder.build(workspace_id, &workspace.project_path, &data.isolation_overrides)?;

    let container = workers.container_manager.create_workspace_container(CreateWorkspaceContainerRequest {
            workspace_id: workspace_id.to_string(),
            workspace_name: workspace.name.clone(),
            image: data.image.clone().unwrap_or_else(|| workers.default_image.clone()),
            command: data.command.clone().unwrap_or_else(|| workers.default_command.clone()),
            env: data.env.clone(),
            isolation,
        }).await?;

    workers.container_manager.start_container(&container.id).await?;

    let mut update: FieldUpdate = HashMap::new();
    update.insert("status", FieldValue::Status(WorkspaceStatus::Active));
    update.insert("active_tasks", FieldValue::ActiveTasksDelta(1));
    workers.store.update(workspace_id, update).await?;
    Ok(())
}

async fn start(workers: &Workers, workspace_id: &str) -> Result<()> {
    let containers = workers.container_manager.list_workspace_containers(workspace_id).await?;
    for container in containers {
        workers.container_manager.start_container(&container.id).await?;
    }
    Ok(())
}

async fn stop(workers: &Workers, workspace_id: &str) -> Result<()> {
    let containers = workers.container_manager.list_workspace_containers(workspace_id).await?;
    for container in containers {
        workers.container_manager.stop_container(&container.id, workers.stop_timeout).await?;
    }
    Ok(())
}

async fn restart(workers: &Workers, workspace_id: &str) -> Result<()> {
    let containers = workers.container_manager.list_workspace_containers(workspace_id).await?;
    for container in containers {
        workers.container_manager.restart_container(&container.id, workers.stop_timeout).await?;
    }
    Ok(())
}

/// Stop is best-effort (errors ignored) so a container stuck in a bad state
/// never blocks reclamation; remove is forced.
async fn delete(workers: &Workers, workspace_id: &str) -> Result<()> {
    let containers = workers.container_manager.list_workspace_containers(workspace_id).await?;
    for container in containers {
        let _ = workers.container_manager.stop_container(&container.id, workers.stop_timeout).await;
        workers.container_manager.remove_container(&container.id, true).await?;
    }
    Ok(())
}

async fn sync(workers: &Workers, workspace_id: &str) -> Result<()> {
    let containers = workers.container_manager.list_workspace_containers(workspace_id).await?;
    let any_running = containers.iter().any(|c| c.state == ContainerState::Running);
    let desired = if any_running {
        WorkspaceStatus::Active
    } else {
        WorkspaceStatus::Inactive
    };

    let mut update: FieldUpdate = HashMap::new();
    update.insert("status", FieldValue::Status(desired));
    workers.store.update(workspace_id, update).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationDefaults;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::storage::memory::InMemoryWorkspaceStore;
    use crate::workspace::Workspace;

    fn executor(store: Arc<dyn WorkspaceStore>) -> Arc<TaskExecutor> {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let container_manager = Arc::new(ContainerManager::new(runtime, "aicli", Duration::from_secs(10)));
        let isolation_builder = Arc::new(IsolationBuilder::new(IsolationDefaults::default()));
        TaskExecutor::new(
            store,
            container_manager,
            isolation_builder,
            3,
            100,
            "debian:bookworm-slim".into(),
            vec!["/bin/sh".into()],
            Duration::from_secs(10),
            Duration::from_secs(8),
        )
    }

    #[tokio::test]
    async fn create_task_starts_container_and_marks_active() {
        let store: Arc<dyn WorkspaceStore> = Arc::new(InMemoryWorkspaceStore::new());
        let workspace = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(workspace).await.unwrap();

        let executor = executor(store.clone());
        let task = WorkspaceTask::new(
            WorkspaceTaskKind::Create(CreateTaskData::default()),
            "ws-1",
            Duration::from_secs(60),
        );
        executor.submit_and_wait(task).await.unwrap();

        let stored = store.get_by_id("ws-1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkspaceStatus::Active);
        assert_eq!(stored.active_tasks, 1);
    }

    #[tokio::test]
    async fn sync_reflects_running_state() {
        let store: Arc<dyn WorkspaceStore> = Arc::new(InMemoryWorkspaceStore::new());
        let workspace = Workspace::new_for_test("ws-2", "demo", "owner-a", "/tmp/p");
        store.create(workspace).await.unwrap();
        let executor = executor(store.clone());

        executor.submit_and_wait(WorkspaceTask::new(
                WorkspaceTaskKind::Create(CreateTaskData::default()),
                "ws-2",
                Duration::from_secs(60),
            )).await.unwrap();

        executor.submit_and_wait(WorkspaceTask::new(WorkspaceTaskKind::Sync, "ws-2", Duration::from_secs(30))).await.unwrap();

        let stored = store.get_by_id("ws-2").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkspaceStatus::Active);
    }
}
