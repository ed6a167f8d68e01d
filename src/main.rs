use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use slicer_lite::cluster_master::LocalClusterMaster;
use slicer_lite::config::{
    ControllerConfig, ExecutionConfig, Lifecycle, RecoveryCleanupType, WorkerConfig,
};
use slicer_lite::controller::{ControllerDeps, ExecutionController, ExecutionStatus};
use slicer_lite::error::SlicerError;
use slicer_lite::scheduler::SliceState;
use slicer_lite::shutdown::install_shutdown_handler;
use slicer_lite::slicer::GeneratorSlicer;
use slicer_lite::store::{
    ExecutionRecord, ExecutionStore, JsonFileStore, MemoryStore, StateStore,
};
use slicer_lite::worker::{FailOnProcessor, NoopProcessor, SliceProcessor, Worker};

#[derive(Parser, Debug)]
#[command(name = "slicer-lite")]
#[command(version)]
#[command(about = "A slice-execution controller with recoverable worker dispatch")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the execution controller for one execution
    Controller(ControllerArgs),

    /// Run one or more workers against a controller
    Worker(WorkerArgs),

    /// Show an execution stored in a JSON store file
    Inspect(InspectArgs),
}

// =============================================================================
// Controller Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Address to accept worker connections on
    #[arg(long, default_value = "127.0.0.1:45680")]
    listen: SocketAddr,

    /// Job description (JSON). Flags below override its fields.
    #[arg(long)]
    job: Option<PathBuf>,

    #[arg(long)]
    ex_id: Option<String>,

    #[arg(long)]
    job_id: Option<String>,

    #[arg(long)]
    lifecycle: Option<LifecycleArg>,

    /// Number of workers expected (bounds dispatch concurrency)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    slicers: Option<usize>,

    /// Records to generate when the job has no reader operation
    #[arg(long, default_value = "10000")]
    size: u64,

    /// Records per slice when the job has no reader operation
    #[arg(long, default_value = "1000")]
    chunk: u64,

    /// Persist stores to this JSON file (in-memory when omitted)
    #[arg(long)]
    store: Option<PathBuf>,

    // === Recovery Options ===
    /// Execution id whose incomplete slices should be reprocessed
    #[arg(long)]
    recover_from: Option<String>,

    /// Which incomplete slices to reprocess
    #[arg(long, default_value = "all", requires = "recover_from")]
    cleanup: CleanupArg,

    // === Timeouts ===
    /// How long to wait for the first worker
    #[arg(long, default_value = "180000")]
    slicer_timeout_ms: u64,

    #[arg(long, default_value = "300000")]
    worker_disconnect_timeout_ms: u64,

    #[arg(long, default_value = "60000")]
    shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum LifecycleArg {
    Once,
    Persistent,
}

#[derive(Debug, Clone, ValueEnum)]
enum CleanupArg {
    Errors,
    All,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Controller address in host:port format
    #[arg(long, short = 'c', default_value = "127.0.0.1:45680")]
    controller: String,

    /// Worker id prefix; a uuid is used when omitted
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of workers to run in this process
    #[arg(long, default_value = "1")]
    count: usize,

    /// Simulated processing time per slice
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Fail the slice with this slicer order (for testing failure handling)
    #[arg(long)]
    fail_order: Option<u64>,
}

// =============================================================================
// Inspect Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct InspectArgs {
    /// JSON store file written by `controller --store`
    store: PathBuf,

    ex_id: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_execution(args: &ControllerArgs) -> Result<ExecutionConfig, SlicerError> {
    let mut execution = match args.job {
        Some(ref path) => ExecutionConfig::from_file(path)?,
        None => ExecutionConfig::default(),
    };

    if let Some(ref ex_id) = args.ex_id {
        execution.ex_id = ex_id.clone();
    }
    if let Some(ref job_id) = args.job_id {
        execution.job_id = job_id.clone();
    }
    if let Some(ref lifecycle) = args.lifecycle {
        execution.lifecycle = match lifecycle {
            LifecycleArg::Once => Lifecycle::Once,
            LifecycleArg::Persistent => Lifecycle::Persistent,
        };
    }
    if let Some(workers) = args.workers {
        execution.workers = workers;
    }
    if let Some(slicers) = args.slicers {
        execution.slicers = slicers;
    }
    if let Some(ref recover_from) = args.recover_from {
        let cleanup = match args.cleanup {
            CleanupArg::Errors => RecoveryCleanupType::Errors,
            CleanupArg::All => RecoveryCleanupType::All,
        };
        execution = execution.with_recovery(recover_from.clone(), cleanup);
    }

    execution.validate()?;
    Ok(execution)
}

type Stores = (Arc<dyn ExecutionStore>, Arc<dyn StateStore>);

async fn open_stores(path: Option<&Path>) -> Result<Stores, SlicerError> {
    match path {
        Some(path) => {
            let store = Arc::new(JsonFileStore::open(path).await?);
            tracing::info!(path = %path.display(), "Using JSON file store");
            Ok((store.clone(), store))
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
    }
}

/// Create the execution record unless it already exists.
async fn ensure_execution(
    ex_store: &Arc<dyn ExecutionStore>,
    execution: &ExecutionConfig,
) -> Result<(), SlicerError> {
    match ex_store.get(&execution.ex_id).await {
        Ok(record) => {
            tracing::info!(ex_id = %record.ex_id, status = %record.status, "Found existing execution");
            Ok(())
        }
        Err(SlicerError::ExecutionNotFound(_)) => {
            let mut record = ExecutionRecord::new(
                &execution.ex_id,
                &execution.job_id,
                ExecutionStatus::Pending,
            );
            record.operations = execution.operations.clone();
            ex_store.create(record).await
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Controller Implementation
// =============================================================================

async fn run_controller(args: ControllerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let execution = build_execution(&args)?;
    let config = ControllerConfig {
        listen_addr: args.listen,
        slicer_timeout_ms: args.slicer_timeout_ms,
        worker_disconnect_timeout_ms: args.worker_disconnect_timeout_ms,
        shutdown_timeout_ms: args.shutdown_timeout_ms,
        ..ControllerConfig::default()
    };

    let slicer = match execution.operations.first() {
        Some(operation) => GeneratorSlicer::from_operation(operation)?,
        None => GeneratorSlicer::new(args.size, args.chunk),
    };

    let (ex_store, state_store) = open_stores(args.store.as_deref()).await?;
    ensure_execution(&ex_store, &execution).await?;

    let cluster_master = Arc::new(LocalClusterMaster::new());
    let ex_id = execution.ex_id.clone();
    let controller = ExecutionController::new(
        config,
        execution,
        ControllerDeps {
            ex_store: ex_store.clone(),
            state_store,
            cluster_master: cluster_master.clone(),
            slicer: Arc::new(slicer),
        },
    )?;

    if !controller.initialize().await? {
        tracing::warn!(ex_id = %ex_id, "Execution could not be started");
        return Ok(());
    }

    // a signal ends the execution the same way a cluster master shutdown does
    let shutdown = install_shutdown_handler();
    let signal_master = cluster_master.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        if let Err(e) = signal_master.server_shutdown() {
            tracing::warn!(error = %e, "Failed to request execution shutdown");
        }
    });

    controller.run().await?;
    controller.shutdown().await?;

    match ex_store.get(&ex_id).await {
        Ok(record) => {
            tracing::info!(
                ex_id = %ex_id,
                status = %record.status,
                processed = record.metadata.stats.processed,
                failed = record.metadata.stats.failed,
                "Execution controller exited"
            );
        }
        Err(e) => tracing::warn!(ex_id = %ex_id, error = %e, "Unable to read final execution status"),
    }
    Ok(())
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_workers(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let delay = std::time::Duration::from_millis(args.delay_ms);
    let processor: Arc<dyn SliceProcessor> = match args.fail_order {
        Some(order) => Arc::new(FailOnProcessor::slicer_order(order).with_delay(delay)),
        None => Arc::new(NoopProcessor::with_delay(delay)),
    };

    let shutdown = install_shutdown_handler();
    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..args.count.max(1) {
        let mut config = WorkerConfig {
            controller_addr: args.controller.clone(),
            ..WorkerConfig::default()
        };
        if let Some(ref prefix) = args.worker_id {
            config.worker_id = if args.count > 1 {
                format!("{}-{}", prefix, n)
            } else {
                prefix.clone()
            };
        }

        let worker = Worker::new(&config, processor.clone())?;
        let cancel = shutdown.clone();
        tasks.spawn(async move {
            worker.start().await?;
            let result = worker.run(cancel).await;
            worker.shutdown().await?;
            result.map(|_| worker.processed())
        });
    }

    let mut processed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(count)) => processed += count,
            Ok(Err(e)) => tracing::error!(error = %e, "Worker failed"),
            Err(e) => tracing::error!(error = %e, "Worker task panicked"),
        }
    }
    tracing::info!(processed, "All workers exited");
    Ok(())
}

// =============================================================================
// Inspect Implementation
// =============================================================================

#[derive(Serialize)]
struct ExecutionSummary {
    ex_id: String,
    job_id: String,
    status: ExecutionStatus,
    slicers_finished: bool,
    failure_reason: Option<String>,
    slices_completed: usize,
    slices_failed: usize,
    slices_started: usize,
}

async fn handle_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonFileStore::open(&args.store).await?;
    let record = store.get(&args.ex_id).await?;
    let summary = ExecutionSummary {
        slices_completed: store.count(&args.ex_id, SliceState::Completed).await?,
        slices_failed: store.count(&args.ex_id, SliceState::Error).await?,
        slices_started: store.count(&args.ex_id, SliceState::Start).await?,
        ex_id: record.ex_id,
        job_id: record.job_id,
        status: record.status,
        slicers_finished: record.slicers_finished,
        failure_reason: record.metadata.failure_reason,
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Table => {
            println!("Execution:        {}", summary.ex_id);
            println!("Job:              {}", summary.job_id);
            println!("Status:           {}", summary.status);
            println!("Slicers Finished: {}", summary.slicers_finished);
            println!();
            println!("{:<12} {:>8}", "STATE", "SLICES");
            println!("{}", "-".repeat(21));
            println!("{:<12} {:>8}", "completed", summary.slices_completed);
            println!("{:<12} {:>8}", "error", summary.slices_failed);
            println!("{:<12} {:>8}", "start", summary.slices_started);
            if let Some(ref reason) = summary.failure_reason {
                println!();
                println!("Failure:");
                println!("  {}", reason);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Controller(controller_args) => {
            run_controller(controller_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_workers(worker_args).await?;
        }
        Commands::Inspect(inspect_args) => {
            handle_inspect(inspect_args).await?;
        }
    }

    Ok(())
}
