//! C10 — Factory / Manager Root.
//!
//! Constructs C1 with validated configuration, then wires C2–C9 to it.
//! Exposes health, reconfiguration, and graceful shutdown.
//!
//! Grounded on `server/manager.rs`'s `Manager` (owns the registry,
//! `shutdown` stopping all running servers) and `cmd/root.rs`'s wiring /
//! shutdown sequencing (a cancellation token cancelled by `ctrl_c`, then a
//! bounded drain).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::batch::BatchCoordinator;
use crate::config::Configuration;
use crate::container_manager::ContainerManager;
use crate::error::Result;
use crate::isolation::IsolationBuilder;
use crate::lifecycle::LifecycleManager;
use crate::recovery::ErrorRecovery;
use crate::runtime::{BollardRuntimeClient, RuntimeClient};
use crate::service::WorkspaceService;
use crate::stats::StatsCollector;
use crate::storage::WorkspaceStore;
use crate::task_executor::TaskExecutor;

/// Owns one fully-wired instance of C1–C9.
pub struct OrchestratorStack {
    pub runtime: Arc<dyn RuntimeClient>,
    pub isolation_builder: Arc<IsolationBuilder>,
    pub container_manager: Arc<ContainerManager>,
    pub lifecycle: Arc<LifecycleManager>,
    pub stats: Arc<StatsCollector>,
    pub task_executor: Arc<TaskExecutor>,
    pub service: Arc<WorkspaceService>,
    pub batch: Arc<BatchCoordinator>,
    pub recovery: Arc<ErrorRecovery>,
}

impl OrchestratorStack {
    async fn build(config: &Configuration, store: Arc<dyn WorkspaceStore>) -> Result<Self> {
        let host = config.runtime.host.clone();
        let runtime: Arc<dyn RuntimeClient> = Arc::new(
            BollardRuntimeClient::connect(host.as_deref(), config.runtime.timeout_secs, &config.runtime.network_name).await?,
        );

        let isolation_builder = Arc::new(IsolationBuilder::new(config.isolation.clone()));
        let container_manager = Arc::new(ContainerManager::new(
            runtime.clone(),
            config.label_prefix.clone(),
            Duration::from_secs(config.executor.stop_timeout_secs),
        ));
        let lifecycle = LifecycleManager::start(runtime.clone(), container_manager.clone(), &config.label_prefix);
        let stats = Arc::new(StatsCollector::new(runtime.clone()));

        let task_executor = TaskExecutor::new(
            store.clone(),
            container_manager.clone(),
            isolation_builder.clone(),
            config.executor.worker_count,
            config.executor.queue_depth,
            config.isolation.default_image.clone(),
            vec![config.isolation.default_shell.clone()],
            Duration::from_secs(config.executor.stop_timeout_secs),
            Duration::from_secs(config.executor.sync_verb_ceiling_secs),
        );

        let service = Arc::new(WorkspaceService::new(
            store.clone(),
            task_executor.clone(),
            container_manager.clone(),
            stats.clone(),
            Duration::from_secs(config.executor.create_timeout_secs),
            Duration::from_secs(config.executor.task_timeout_secs),
        ));

        let batch = BatchCoordinator::new(
            service.clone(),
            config.batch.concurrency,
            Duration::from_secs(config.batch.restart_settle_secs),
        );

        let recovery = Arc::new(ErrorRecovery::new(container_manager.clone(), task_executor.clone(), store));

        Ok(Self {
            runtime,
            isolation_builder,
            container_manager,
            lifecycle,
            stats,
            task_executor,
            service,
            batch,
            recovery,
        })
    }

    async fn shutdown(&self) {
        self.lifecycle.shutdown();
        self.task_executor.shutdown().await;
    }
}

/// Owns the live [`OrchestratorStack`] and the configuration it was built
/// from; supports atomic reconfiguration and graceful shutdown.
///
/// Unlike the daemon's default-manager singleton, this is never a
/// lazily-initialized `static` — callers construct it once (typically in
/// `main`) and pass it down by `Arc`, with an explicit `reset` available to
/// tests instead of relying on load-order-sensitive lazy init.
pub struct Factory {
    config: RwLock<Configuration>,
    stack: RwLock<Arc<OrchestratorStack>>,
    store: Arc<dyn WorkspaceStore>,
}

impl Factory {
    pub async fn new(config: Configuration, store: Arc<dyn WorkspaceStore>) -> Result<Self> {
        let stack = OrchestratorStack::build(&config, store.clone()).await?;
        Ok(Self {
            config: RwLock::new(config),
            stack: RwLock::new(Arc::new(stack)),
            store,
        })
    }

    pub fn stack(&self) -> Arc<OrchestratorStack> {
        self.stack.read().clone()
    }

    /// `ping ∧ network exists`.
    pub async fn is_healthy(&self) -> bool {
        let stack = self.stack();
        if stack.runtime.ping().await.is_err() {
            return false;
        }
        let network_name = self.config.read().runtime.network_name.clone();
        stack.runtime.network_inspect(&network_name).await.is_ok()
    }

    /// Tears down C4 and C1, then constructs a fresh stack, preserving
    /// configuration.
    pub async fn reinitialize(&self) -> Result<()> {
        let old_stack = self.stack();
        old_stack.shutdown().await;

        let config = self.config.read().clone();
        let fresh = OrchestratorStack::build(&config, self.store.clone()).await?;
        *self.stack.write() = Arc::new(fresh);
        info!("orchestrator stack reinitialized");
        Ok(())
    }

    /// Atomically swaps configuration and reinitializes.
    pub async fn update_config(&self, new_config: Configuration) -> Result<()> {
        *self.config.write() = new_config;
        self.reinitialize().await
    }

    /// Cancels the root context, stops C4 and C6 workers (draining
    /// in-flight tasks to their callback), and closes C1.
    pub async fn shutdown(&self) {
        self.stack().shutdown().await;
        info!("orchestrator factory shut down");
    }

    pub fn config(&self) -> Configuration {
        self.config.read().clone()
    }
}
