use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use task_dispatcher::{
    ShutdownReason, TaskKind, TasksManager,
    config::{ServerConfig, WorkerConfig},
    constants::DEFAULT_PORT,
    loader, run_server, run_worker,
    shutdown::install_shutdown_handler,
};

#[derive(Parser, Debug)]
#[command(name = "task_dispatcher")]
#[command(version)]
#[command(about = "Distribute shell commands to workers over TCP")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a list of tasks to connecting workers
    Server(ServerArgs),
    /// Connect to a server and run the tasks it hands out
    Worker(WorkerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on (eg. localhost or 0.0.0.0)
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// File with one command per line; stdin when omitted
    #[arg(short, long, value_name = "FILE", conflicts_with = "manifest")]
    tasks: Option<PathBuf>,

    /// File with one result path per line, matching the commands line by line
    #[arg(short, long, value_name = "FILE", conflicts_with = "manifest")]
    results: Option<PathBuf>,

    /// JSON manifest describing every task
    #[arg(short, long, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Result kind of the tasks read from a command list
    #[arg(short, long, value_enum, default_value_t = TaskKind::FileOutput)]
    kind: TaskKind,

    /// Do not draw the progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 1)]
    connect_attempts: u32,

    /// Delay between connection attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Consecutive execution failures tolerated before stopping
    #[arg(long, default_value_t = 3)]
    max_failures: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("task_dispatcher=info")),
        )
        .init();

    let args = Args::parse();
    let outcome = match args.command {
        Commands::Server(args) => serve(args).await,
        Commands::Worker(args) => work(args).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServerArgs) -> Result<ExitCode> {
    let tasks = match &args.manifest {
        Some(manifest) => loader::read_manifest_from(manifest)?,
        None => {
            let commands = loader::read_lines_from(args.tasks.as_deref())?;
            let destinations: Option<Vec<PathBuf>> = args
                .results
                .as_deref()
                .map(|path| loader::read_lines_from(Some(path)))
                .transpose()?
                .map(|lines| lines.into_iter().map(PathBuf::from).collect());
            loader::build_tasks(commands, destinations, args.kind)?
        }
    };
    loader::prepare_destinations(&tasks).context("preparing result directories")?;

    let config = ServerConfig::new(args.address, args.port).with_progress(!args.no_progress);
    let manager = Arc::new(TasksManager::new(tasks));
    let shutdown = install_shutdown_handler();

    let reason = run_server(&config, Arc::clone(&manager), shutdown)
        .await
        .context("running server")?;

    info!(progress = %manager.progress(), "closing server");
    Ok(match reason {
        ShutdownReason::Completed => ExitCode::SUCCESS,
        ShutdownReason::Interrupted => ExitCode::from(130),
    })
}

async fn work(args: WorkerArgs) -> Result<ExitCode> {
    let config = WorkerConfig::new(args.address, args.port)
        .with_connect_attempts(args.connect_attempts, Duration::from_millis(args.retry_delay_ms))
        .with_max_consecutive_failures(args.max_failures);

    let shutdown = install_shutdown_handler();
    tokio::select! {
        summary = run_worker(&config) => {
            let summary = summary.context("worker stopped")?;
            info!(completed = summary.completed, sessions = summary.sessions, "worker done");
            Ok(ExitCode::SUCCESS)
        }
        _ = shutdown.cancelled() => {
            info!("worker stopped by user");
            Ok(ExitCode::from(130))
        }
    }
}
