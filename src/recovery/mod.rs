//! C9 — Error Recovery.
//!
//! Classifies a failed workspace operation and selects a retry/rebuild/
//! fallback strategy, driving the task executor (C6) on failure.
//!
//! Grounded on `server/crash.rs`'s `CrashHandler` (windowed crash counting
//! that disables auto-restart past a limit), generalized from "disable
//! restart after N crashes" to "classify, retry with linear backoff, or
//! fall back" — the windowed-counter idiom survives, the policy it drives
//! changes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::container_manager::{ContainerManager, ContainerState};
use crate::error::{OrchestratorError, Result};
use crate::storage::{FieldUpdate, FieldValue, WorkspaceStore};
use crate::task_executor::{CreateTaskData, TaskExecutor, WorkspaceTask, WorkspaceTaskKind};
use crate::workspace::WorkspaceStatus;

/// Final disposition applied once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    Stop,
    Remove,
    Ignore,
}

/// Per-call recovery policy.
#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub fallback_action: FallbackAction,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            fallback_action: FallbackAction::Ignore,
        }
    }
}

/// Outcome of one [`ErrorRecovery::recover`] call, for callers/tests that
/// want to observe what action was taken without reaching into logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The container was restarted (possibly after several backed-off attempts).
    Restarted,
    /// The container was rebuilt (deleted then recreated).
    Rebuilt,
    /// Retries were exhausted or no container state applied; `fallback_action` ran.
    FallbackApplied(FallbackAction),
    /// Retries exhausted, workspace marked `inactive`, original error returned.
    Exhausted,
}

/// Classifies errors and drives C6 on failure.
pub struct ErrorRecovery {
    container_manager: Arc<ContainerManager>,
    task_executor: Arc<TaskExecutor>,
    store: Arc<dyn WorkspaceStore>,
}

impl ErrorRecovery {
    pub fn new(
        container_manager: Arc<ContainerManager>,
        task_executor: Arc<TaskExecutor>,
        store: Arc<dyn WorkspaceStore>,
    ) -> Self {
        Self {
            container_manager,
            task_executor,
            store,
        }
    }

    /// Given a failed workspace operation, classifies the container's
    /// current state and applies `strategy` :
    ///
    /// 1. `exited` → retry loop (restart) with linear backoff.
    /// 2. `dead` → rebuild (delete then create).
    /// 3. otherwise → apply `strategy.fallback_action`.
    ///
    /// On retry/rebuild exhaustion, the workspace status is set to
    /// `inactive` and the original error is returned.
    pub async fn recover(
        &self,
        workspace_id: &str,
        container_id: &str,
        original_error: OrchestratorError,
        strategy: &RecoveryStrategy,
    ) -> Result<RecoveryOutcome> {
        let state = self.container_manager.inspect_container(container_id).await.map(|c| c.state);

        match state {
            Ok(ContainerState::Exited) => self.retry_restart(workspace_id, strategy, original_error).await,
            Ok(ContainerState::Dead) => self.rebuild(workspace_id, strategy, original_error).await,
            _ => Ok(self.apply_fallback(workspace_id, strategy.fallback_action).await?),
        }
    }

    async fn retry_restart(
        &self,
        workspace_id: &str,
        strategy: &RecoveryStrategy,
        original_error: OrchestratorError,
    ) -> Result<RecoveryOutcome> {
        for attempt in 1..=strategy.max_retries {
            let delay = strategy.backoff_base * attempt;
            tokio::time::sleep(delay).await;

            let task = WorkspaceTask::new(WorkspaceTaskKind::Restart, workspace_id, Duration::from_secs(30));
            match self.task_executor.submit_and_wait(task).await {
                Ok(_) => {
                    info!(workspace_id, attempt, "recovery restart succeeded");
                    return Ok(RecoveryOutcome::Restarted);
                }
                Err(e) => {
                    warn!(workspace_id, attempt, error = %e, "recovery restart attempt failed");
                }
            }
        }
        self.exhaust(workspace_id, original_error).await
    }

    async fn rebuild(
        &self,
        workspace_id: &str,
        strategy: &RecoveryStrategy,
        original_error: OrchestratorError,
    ) -> Result<RecoveryOutcome> {
        for attempt in 1..=strategy.max_retries {
            let delay = strategy.backoff_base * attempt;
            tokio::time::sleep(delay).await;

            let delete = WorkspaceTask::new(WorkspaceTaskKind::Delete, workspace_id, Duration::from_secs(30));
            let create = WorkspaceTask::new(
                WorkspaceTaskKind::Create(CreateTaskData::default()),
                workspace_id,
                Duration::from_secs(60),
            );

            let result = async {
                self.task_executor.submit_and_wait(delete).await?;
                self.task_executor.submit_and_wait(create).await
            }.await;

            match result {
                Ok(_) => {
                    info!(workspace_id, attempt, "recovery rebuild succeeded");
                    return Ok(RecoveryOutcome::Rebuilt);
                }
                Err(e) => {
                    warn!(workspace_id, attempt, error = %e, "recovery rebuild attempt failed");
                }
            }
        }
        self.exhaust(workspace_id, original_error).await
    }

    async fn apply_fallback(&self, workspace_id: &str, action: FallbackAction) -> Result<RecoveryOutcome> {
        match action {
            FallbackAction::Stop => {
                let task = WorkspaceTask::new(WorkspaceTaskKind::Stop, workspace_id, Duration::from_secs(30));
                self.task_executor.submit(task).await?;
            }
            FallbackAction::Remove => {
                let task = WorkspaceTask::new(WorkspaceTaskKind::Delete, workspace_id, Duration::from_secs(30));
                self.task_executor.submit(task).await?;
            }
            FallbackAction::Ignore => {}
        }
        Ok(RecoveryOutcome::FallbackApplied(action))
    }

    /// Marks the workspace `inactive` and returns the original error (/// "On exhaustion the workspace status is set to `inactive` and the
    /// error is returned").
    async fn exhaust(&self, workspace_id: &str, original_error: OrchestratorError) -> Result<RecoveryOutcome> {
        let mut update: FieldUpdate = std::collections::HashMap::new();
        update.insert("status", FieldValue::Status(WorkspaceStatus::Inactive));
        if let Err(e) = self.store.update(workspace_id, update).await {
            warn!(workspace_id, error = %e, "failed to mark workspace inactive after exhausting recovery");
        }
        warn!(workspace_id, error = %original_error, "recovery exhausted");
        Err(original_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationDefaults;
    use crate::container_manager::CreateWorkspaceContainerRequest;
    use crate::isolation::IsolationBuilder;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::storage::memory::InMemoryWorkspaceStore;
    use crate::workspace::Workspace;
    use std::collections::HashMap as Map;

    async fn setup() -> (ErrorRecovery, Arc<ContainerManager>, Arc<dyn WorkspaceStore>, String) {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let container_manager = Arc::new(ContainerManager::new(runtime.clone(), "aicli", Duration::from_secs(10)));
        let isolation_builder = Arc::new(IsolationBuilder::new(IsolationDefaults::default()));
        let store: Arc<dyn WorkspaceStore> = Arc::new(InMemoryWorkspaceStore::new());

        let workspace = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(workspace).await.unwrap();

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

        let recovery = ErrorRecovery::new(container_manager.clone(), executor, store.clone());
        (recovery, container_manager, store, "ws-1".to_string())
    }

    #[tokio::test]
    async fn exited_container_is_restarted() {
        let (recovery, container_manager, _store, workspace_id) = setup().await;
        let container = container_manager.create_workspace_container(CreateWorkspaceContainerRequest {
                workspace_id: workspace_id.clone(),
                workspace_name: "demo".into(),
                image: "debian".into(),
                command: vec![],
                env: Map::new(),
                isolation: IsolationBuilder::new(IsolationDefaults::default()).build(&workspace_id, "/tmp/p", &Default::default()).unwrap(),
            }).await.unwrap();
        container_manager.start_container(&container.id).await.unwrap();
        container_manager.stop_container(&container.id, Duration::from_secs(1)).await.unwrap();

        let strategy = RecoveryStrategy {
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            fallback_action: FallbackAction::Ignore,
        };
        let outcome = recovery.recover(
                &workspace_id,
                &container.id,
                OrchestratorError::state("container exited"),
                &strategy,
            ).await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Restarted);
    }

    #[tokio::test]
    async fn non_exited_non_dead_applies_fallback() {
        let (recovery, container_manager, _store, workspace_id) = setup().await;
        let container = container_manager.create_workspace_container(CreateWorkspaceContainerRequest {
                workspace_id: workspace_id.clone(),
                workspace_name: "demo".into(),
                image: "debian".into(),
                command: vec![],
                env: Map::new(),
                isolation: IsolationBuilder::new(IsolationDefaults::default()).build(&workspace_id, "/tmp/p", &Default::default()).unwrap(),
            }).await.unwrap();

        let strategy = RecoveryStrategy {
            fallback_action: FallbackAction::Ignore,..Default::default()
        };
        let outcome = recovery.recover(
                &workspace_id,
                &container.id,
                OrchestratorError::state("some transient issue"),
                &strategy,
            ).await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::FallbackApplied(FallbackAction::Ignore));
    }
}
