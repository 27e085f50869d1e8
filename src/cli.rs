//! CLI entry points: the worker itself plus small operator commands for
//! seeding, inspecting and resetting the shared queue state.

use clap::{Parser, Subcommand};
use console::style;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::queue::{connect_backend, BackendKind};
use crate::worker::{self, run_static, spawn_signal_listener, QueueWorker, ShutdownFlag};

#[derive(Parser)]
#[command(name = "gridsweep")]
#[command(about = "Queue-backed distributed parameter sweep workers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker (default when no subcommand is given)
    Run {
        /// Worker identity; overrides WORKER_ID
        #[arg(long)]
        worker_id: Option<u32>,
        /// Queue backend: streams or broker; overrides QUEUE_BACKEND
        #[arg(long)]
        backend: Option<String>,
        /// Batch size in parameters; overrides TOTAL_PARAMETERS
        #[arg(long)]
        total_params: Option<u64>,
        /// Parameters per chunk; overrides CHUNK_SIZE
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Seed the task container with the batch's chunks
    Seed {
        /// Purge all containers first and reseed from scratch
        #[arg(long)]
        force: bool,
    },

    /// Print queue statistics as JSON
    Stats,

    /// Delete all tasks, retries, dead letters and results
    Reset,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run {
        worker_id: None,
        backend: None,
        total_params: None,
        chunk_size: None,
    });

    match command {
        Commands::Run {
            worker_id,
            backend,
            total_params,
            chunk_size,
        } => {
            let mut config = WorkerConfig::from_env()?;
            if let Some(id) = worker_id {
                config.worker_id = id;
            }
            if let Some(ref raw) = backend {
                config.backend = BackendKind::parse(raw)
                    .ok_or_else(|| anyhow::anyhow!("unknown backend {:?}", raw))?;
                config.use_queue = true;
            }
            if let Some(total) = total_params {
                config.total_parameters = total;
            }
            if let Some(size) = chunk_size {
                config.chunk_size = size;
            }

            run_worker(config).await
        }
        Commands::Seed { force } => {
            let config = WorkerConfig::from_env()?;
            let mut backend = connect_backend(&config).await?;
            let created = backend
                .seed(config.total_parameters, config.chunk_size, force)
                .await?;
            backend.disconnect().await;
            if created == 0 {
                println!(
                    "{} task container already seeded; use --force to reseed",
                    style("unchanged:").yellow()
                );
            } else {
                println!("{} {} chunks", style("seeded:").green(), created);
            }
            Ok(())
        }
        Commands::Stats => {
            let config = WorkerConfig::from_env()?;
            let mut backend = connect_backend(&config).await?;
            let stats = backend.stats().await?;
            backend.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Reset => {
            let config = WorkerConfig::from_env()?;
            let mut backend = connect_backend(&config).await?;
            backend.purge().await?;
            backend.disconnect().await;
            println!("{} all queue state deleted", style("reset:").red());
            Ok(())
        }
    }
}

/// Run the worker in the mode the configuration selects, print the final
/// summary line, and exit with the status-mapped code.
async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    let shutdown = ShutdownFlag::new();
    spawn_signal_listener(shutdown.clone());

    info!(
        "gridsweep worker {} starting (backend: {}, batch: {} params / {} per chunk)",
        config.worker_id,
        if config.use_queue {
            config.backend.as_str()
        } else {
            "static"
        },
        config.total_parameters,
        config.chunk_size
    );

    let summary = if config.use_queue {
        match QueueWorker::connect(config.clone(), shutdown).await {
            Ok(worker) => worker.run().await,
            Err(e) => {
                error!("Worker {} could not start: {}", config.worker_id, e);
                worker::failed_summary(&config, e.to_string())
            }
        }
    } else {
        run_static(config, shutdown).await
    };

    // The one machine-readable line on stdout; logs go to stderr.
    println!("{}", serde_json::to_string(&summary)?);

    let code = summary.status.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
