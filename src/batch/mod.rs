//! C8 — Batch Coordinator.
//!
//! Concurrency-bounded fan-out of one operation across many workspace ids,
//! tracking progress, per-id errors, and cancellation.
//!
//! Grounded on `server/manager.rs::initialize()`'s `Semaphore`-bounded
//! concurrent fan-out — same pattern, different cardinality (5 instead of
//! `num_cpus::get`) and target (C7 verbs instead of `Server::new()`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::service::WorkspaceService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    Start,
    Stop,
    Restart,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// A coordinator-scoped record of one operation fanned out across a set of
/// workspace ids.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: String,
    pub owner_id: String,
    pub operation: BatchOperation,
    pub workspace_ids: Vec<String>,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    pub results: HashMap<String, bool>,
    pub errors: Vec<(String, String)>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    cancel_requested: Arc<AtomicBool>,
}

/// Request payload for [`BatchCoordinator::start_batch_operation`].
pub struct StartBatchOperationRequest {
    pub operation: BatchOperation,
    pub workspace_ids: Vec<String>,
}

pub struct BatchCoordinator {
    service: Arc<WorkspaceService>,
    jobs: DashMap<String, BatchJob>,
    concurrency: usize,
    restart_settle: Duration,
}

impl BatchCoordinator {
    pub fn new(service: Arc<WorkspaceService>, concurrency: usize, restart_settle: Duration) -> Arc<Self> {
        Arc::new(Self {
            service,
            jobs: DashMap::new(),
            concurrency,
            restart_settle,
        })
    }

    /// Creates a `pending` [`BatchJob`] and launches the coordinator task,
    /// returning the batch id immediately.
    pub fn start_batch_operation(
        self: &Arc<Self>,
        req: StartBatchOperationRequest,
        owner_id: String,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let job = BatchJob {
            id: id.clone(),
            owner_id: owner_id.clone(),
            operation: req.operation,
            workspace_ids: req.workspace_ids.clone(),
            status: BatchStatus::Pending,
            progress: BatchProgress {
                total: req.workspace_ids.len() as u64,..Default::default()
            },
            results: HashMap::new(),
            errors: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        };
        self.jobs.insert(id.clone(), job);

        let coordinator = self.clone();
        let batch_id = id.clone();
        tokio::spawn(async move {
            coordinator.run(batch_id, owner_id).await;
        });

        id
    }

    async fn run(self: Arc<Self>, batch_id: String, owner_id: String) {
        let (operation, workspace_ids, cancel_requested) = {
            let mut job = match self.jobs.get_mut(&batch_id) {
                Some(job) => job,
                None => return,
            };
            job.status = BatchStatus::InProgress;
            (job.operation, job.workspace_ids.clone(), job.cancel_requested.clone())
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for workspace_id in workspace_ids {
            if cancel_requested.load(Ordering::SeqCst) {
                self.record_skip(&batch_id, &workspace_id);
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await;
            let service = self.service.clone();
            let owner_id = owner_id.clone();
            let coordinator = self.clone();
            let batch_id_inner = batch_id.clone();
            let settle = self.restart_settle;
            let cancel_requested = cancel_requested.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if cancel_requested.load(Ordering::SeqCst) {
                    coordinator.record_skip(&batch_id_inner, &workspace_id);
                    return;
                }
                let result = dispatch(&service, operation, &workspace_id, &owner_id, settle).await;
                coordinator.record_result(&batch_id_inner, &workspace_id, result);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        self.finalize(&batch_id);
    }

    fn record_result(&self, batch_id: &str, workspace_id: &str, result: Result<()>) {
        if let Some(mut job) = self.jobs.get_mut(batch_id) {
            match result {
                Ok(_) => {
                    job.progress.completed += 1;
                    job.results.insert(workspace_id.to_string(), true);
                }
                Err(e) => {
                    job.progress.failed += 1;
                    job.results.insert(workspace_id.to_string(), false);
                    job.errors.push((workspace_id.to_string(), e.to_string()));
                }
            }
        }
    }

    fn record_skip(&self, batch_id: &str, workspace_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(batch_id) {
            job.progress.skipped += 1;
            job.results.insert(workspace_id.to_string(), false);
        }
    }

    fn finalize(&self, batch_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(batch_id) {
            if job.cancel_requested.load(Ordering::SeqCst) {
                job.status = BatchStatus::Cancelled;
            } else if job.progress.failed > 0 {
                job.status = BatchStatus::Failed;
            } else {
                job.status = BatchStatus::Completed;
            }
            job.end_time = Some(Utc::now());
            info!(batch_id, status = ?job.status, completed = job.progress.completed, failed = job.progress.failed, "batch operation finished");
        }
    }

    pub fn get_batch_operation_status(&self, id: &str) -> Result<BatchJob> {
        self.jobs.get(id).map(|e| e.value().clone()).ok_or_else(|| OrchestratorError::not_found(format!("batch operation {id} not found")))
    }

    /// Cancels a batch job if it is still `pending`/`in_progress`.
    /// Terminal states are not cancellable.
    pub fn cancel_batch_operation(&self, id: &str) -> Result<()> {
        let job = self.jobs.get(id).ok_or_else(|| OrchestratorError::not_found(format!("batch operation {id} not found")))?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::state("batch operation is already in a terminal state"));
        }
        job.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn list_batch_operations(&self, limit: usize) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs.truncate(limit);
        jobs
    }

    /// Sweeps jobs whose `start_time` is older than `older_than`,
    /// regardless of terminal/non-terminal status (equal treatment by age,
    /// not just terminal jobs).
    pub fn cleanup_batch_operations(&self, older_than: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        self.jobs.retain(|_, job| job.start_time >= cutoff);
    }
}

async fn dispatch(
    service: &Arc<WorkspaceService>,
    operation: BatchOperation,
    workspace_id: &str,
    owner_id: &str,
    restart_settle: Duration,
) -> Result<()> {
    match operation {
        BatchOperation::Start => service.activate_workspace(workspace_id, owner_id).await.map(|_| ()),
        BatchOperation::Stop => service.deactivate_workspace(workspace_id, owner_id).await.map(|_| ()),
        BatchOperation::Restart => {
            if let Err(e) = service.deactivate_workspace(workspace_id, owner_id).await {
                warn!(workspace_id, error = %e, "restart: deactivate step failed, proceeding to activate anyway");
            }
            tokio::time::sleep(restart_settle).await;
            service.activate_workspace(workspace_id, owner_id).await.map(|_| ())
        }
        BatchOperation::Delete => service.delete_workspace(workspace_id, owner_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationDefaults;
    use crate::container_manager::ContainerManager;
    use crate::isolation::IsolationBuilder;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::service::CreateWorkspaceRequest;
    use crate::stats::StatsCollector;
    use crate::storage::memory::InMemoryWorkspaceStore;
    use crate::storage::WorkspaceStore;
    use crate::task_executor::TaskExecutor;

    async fn setup() -> (Arc<BatchCoordinator>, Arc<WorkspaceService>) {
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
            "debian".into(),
            vec!["/bin/sh".into()],
            Duration::from_secs(10),
            Duration::from_secs(8),
        );
        let stats = Arc::new(StatsCollector::new(runtime));
        let service = Arc::new(WorkspaceService::new(
            store,
            executor,
            container_manager,
            stats,
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));
        let coordinator = BatchCoordinator::new(service.clone(), 5, Duration::from_millis(10));
        (coordinator, service)
    }

    #[tokio::test]
    async fn batch_restart_across_three_workspaces_completes() {
        let (coordinator, service) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            let created = service.create_workspace(CreateWorkspaceRequest {
                    name: format!("demo-{i}"),
                    owner_id: "owner-a".into(),
                    project_path: dir.path().to_string_lossy().to_string(),
                    claude_key: None,
                }).await.unwrap();
            service.update_active_task_count(&created.id, "owner-a", -1).await.unwrap();
            ids.push(created.id);
        }

        let batch_id = coordinator.start_batch_operation(
            StartBatchOperationRequest {
                operation: BatchOperation::Restart,
                workspace_ids: ids,
            },
            "owner-a".into(),
        );

        let job = loop {
            let job = coordinator.get_batch_operation_status(&batch_id).unwrap();
            if job.status.is_terminal() {
                break job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        assert_eq!(job.status, BatchStatus::Completed);
        assert_eq!(job.progress.completed, 3);
        assert_eq!(job.progress.failed, 0);
    }

    #[tokio::test]
    async fn cancel_refused_on_terminal_job() {
        let (coordinator, service) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        let created = service.create_workspace(CreateWorkspaceRequest {
                name: "demo".into(),
                owner_id: "owner-a".into(),
                project_path: dir.path().to_string_lossy().to_string(),
                claude_key: None,
            }).await.unwrap();
        service.update_active_task_count(&created.id, "owner-a", -1).await.unwrap();

        let batch_id = coordinator.start_batch_operation(
            StartBatchOperationRequest {
                operation: BatchOperation::Stop,
                workspace_ids: vec![created.id],
            },
            "owner-a".into(),
        );

        loop {
            let job = coordinator.get_batch_operation_status(&batch_id).unwrap();
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = coordinator.cancel_batch_operation(&batch_id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
    }
}
