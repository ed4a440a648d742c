//! Thin CLI harness exercising the factory's (C10) wiring end to end.
//!
//! The orchestration core defines no CLI or wire protocol of its own ;
//! this binary is a peripheral demonstration of one process constructing a
//! [`Factory`] and driving the public verbs through it, the same role the
//! daemon's own `main.rs` plays over `cmd::root::run()`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use workspace_orchestrator::batch::{BatchOperation, StartBatchOperationRequest};
use workspace_orchestrator::service::CreateWorkspaceRequest;
use workspace_orchestrator::storage::sqlite::SqliteWorkspaceStore;
use workspace_orchestrator::storage::WorkspaceStore;
use workspace_orchestrator::{Configuration, Factory};

#[derive(Parser)]
#[command(name = "aicli-orchestratord")]
#[command(about = "Workspace container orchestration core - CLI harness")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Path to the SQLite workspace store. Defaults to an in-memory store
    /// so the harness leaves no state behind between invocations.
    #[arg(long, env = "AICLI_STORE_PATH")]
    store: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a workspace and bring it up.
    Create {
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        claude_key: Option<String>,
    },
    /// Activate an inactive workspace.
    Start {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Deactivate a workspace.
    Stop {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Restart a workspace (deactivate, settle, activate).
    Restart {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Soft-delete a workspace after runtime cleanup.
    Delete {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// List an owner's workspaces.
    List {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        page_size: u64,
    },
    /// Print aggregated resource stats for one workspace.
    Stats {
        id: String,
        #[arg(long)]
        owner: String,
    },
    /// Fan an operation out across several workspace ids, concurrency-bounded.
    Batch {
        #[arg(long)]
        owner: String,
        #[arg(value_enum)]
        operation: BatchOperationArg,
        ids: Vec<String>,
    },
    /// Poll a previously started batch operation's progress.
    BatchStatus { id: String },
    /// Ping the runtime and confirm the managed network exists.
    Health,
    /// Tear the factory's stack down cleanly.
    Shutdown,
}

#[derive(Clone, Copy, ValueEnum)]
enum BatchOperationArg {
    Start,
    Stop,
    Restart,
    Delete,
}

impl From<BatchOperationArg> for BatchOperation {
    fn from(value: BatchOperationArg) -> Self {
        match value {
            BatchOperationArg::Start => BatchOperation::Start,
            BatchOperationArg::Stop => BatchOperation::Stop,
            BatchOperationArg::Restart => BatchOperation::Restart,
            BatchOperationArg::Delete => BatchOperation::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("workspace_orchestrator={log_level}").into()),
        )
        .init();

    info!("starting orchestrator harness v{}", env!("CARGO_PKG_VERSION"));

    let config = Configuration::load(&cli.config)?;
    let store: Arc<dyn WorkspaceStore> = match &cli.store {
        Some(path) => Arc::new(SqliteWorkspaceStore::open(path)?),
        None => Arc::new(SqliteWorkspaceStore::open_in_memory()?),
    };

    let factory = Factory::new(config, store).await?;

    if let Err(e) = run(&factory, cli.command).await {
        error!("command failed: {e}");
        factory.shutdown().await;
        return Ok(ExitCode::FAILURE);
    }

    factory.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

async fn run(factory: &Factory, command: Commands) -> Result<()> {
    let stack = factory.stack();

    match command {
        Commands::Create { name, owner, path, claude_key } => {
            let workspace = stack.service.create_workspace(CreateWorkspaceRequest {
                    name,
                    owner_id: owner,
                    project_path: path,
                    claude_key,
                }).await?;
            println!("created workspace {} ({})", workspace.id, workspace.name);
        }
        Commands::Start { id, owner } => {
            let workspace = stack.service.activate_workspace(&id, &owner).await?;
            println!("{} is now {}", workspace.id, workspace.status.as_str());
        }
        Commands::Stop { id, owner } => {
            let workspace = stack.service.deactivate_workspace(&id, &owner).await?;
            println!("{} is now {}", workspace.id, workspace.status.as_str());
        }
        Commands::Restart { id, owner } => {
            stack.service.deactivate_workspace(&id, &owner).await?;
            let workspace = stack.service.activate_workspace(&id, &owner).await?;
            println!("{} is now {}", workspace.id, workspace.status.as_str());
        }
        Commands::Delete { id, owner } => {
            stack.service.delete_workspace(&id, &owner).await?;
            println!("deleted {id}");
        }
        Commands::List { owner, page, page_size } => {
            let page = stack.service.list_workspaces(&owner, page, page_size).await?;
            println!("{} of {} workspaces", page.items.len(), page.total);
            for workspace in page.items {
                println!("  {}  {}  {}", workspace.id, workspace.name, workspace.status.as_str());
            }
        }
        Commands::Stats { id, owner } => {
            let stats = stack.service.get_workspace_stats(&id, &owner).await?;
            println!(
                "containers={} cpu_avg={:.1}% mem={}B rx={:.2}MB tx={:.2}MB",
                stats.container_count,
                stats.average_cpu_percent,
                stats.total_memory_usage_bytes,
                stats.total_rx_mb,
                stats.total_tx_mb
            );
        }
        Commands::Batch { owner, operation, ids } => {
            let batch_id = stack.batch.start_batch_operation(
                StartBatchOperationRequest {
                    operation: operation.into(),
                    workspace_ids: ids,
                },
                owner,
            );
            println!("started batch {batch_id}");
        }
        Commands::BatchStatus { id } => {
            let job = stack.batch.get_batch_operation_status(&id)?;
            println!(
                "{:?}: {}/{} completed, {} failed, {} skipped",
                job.status, job.progress.completed, job.progress.total, job.progress.failed, job.progress.skipped
            );
        }
        Commands::Health => {
            println!("healthy={}", factory.is_healthy().await);
        }
        Commands::Shutdown => {
            info!("shutdown requested");
        }
    }

    Ok(())
}
