use clap::{Parser, ValueEnum};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use twostage::config::{BackendMode, SchedulerConfig};
use twostage::node::Node;
use twostage::reporter::{run_reported, ReportContext, StatusReporter};
use twostage::scheduler::{Job, JobKind, JobStatus};
use twostage::shutdown::install_shutdown_handler;
use twostage::store::{JobFilter, JobStore, NewStageA, NewStageB};

#[derive(Parser, Debug)]
#[command(name = "twostage")]
#[command(version)]
#[command(about = "Two-stage batch job scheduler")]
#[command(propagate_version = true)]
struct Args {
    /// Configuration file (default: ./twostage.toml if present)
    #[arg(long, short = 'c', global = true, env = "TWOSTAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overrides [database] url
    #[arg(long, global = true, env = "TWOSTAGE_DATABASE_URL")]
    database: Option<String>,

    /// Log at debug level
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the submitter, backend and status monitor until SIGINT/SIGTERM
    Serve(ServeArgs),

    /// Create the job tables
    InitDb,

    /// Job management commands
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Send one status report for the current job (inside a job only)
    Report {
        status: ReportStatus,

        /// Runtime in seconds
        #[arg(long)]
        duration: Option<i64>,

        /// Location of the job's result
        #[arg(long)]
        result: Option<String>,
    },

    /// Run a command with status reporting and the walltime guard (inside a job only)
    Run {
        /// Result location reported on success
        #[arg(long)]
        result: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[arg(long)]
    backend: Option<BackendArg>,

    /// Seconds between submission cycles
    #[arg(long)]
    interval: Option<u64>,

    /// Maximum number of jobs queued in the backend
    #[arg(long)]
    max_queued: Option<usize>,

    /// Host name published to jobs for status reports
    #[arg(long)]
    host: Option<String>,

    /// Status monitor port
    #[arg(long)]
    port: Option<u16>,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Local executor pool size
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Local,
    Batch,
}

impl From<BackendArg> for BackendMode {
    fn from(mode: BackendArg) -> Self {
        match mode {
            BackendArg::Local => BackendMode::Local,
            BackendArg::Batch => BackendMode::Batch,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    StageA,
    StageB,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::StageA => JobKind::StageA,
            KindArg::StageB => JobKind::StageB,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Created,
    Queued,
    Running,
    Success,
    Failed,
    WalltimeExceeded,
}

impl From<StatusArg> for JobStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Created => JobStatus::Created,
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Success => JobStatus::Success,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::WalltimeExceeded => JobStatus::WalltimeExceeded,
        }
    }
}

/// Statuses a job may report about itself.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportStatus {
    Running,
    Success,
    Failed,
    WalltimeExceeded,
}

impl From<ReportStatus> for JobStatus {
    fn from(status: ReportStatus) -> Self {
        match status {
            ReportStatus::Running => JobStatus::Running,
            ReportStatus::Success => JobStatus::Success,
            ReportStatus::Failed => JobStatus::Failed,
            ReportStatus::WalltimeExceeded => JobStatus::WalltimeExceeded,
        }
    }
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Add a stage-A (simulation) job
    AddA {
        #[arg(long)]
        priority: Option<i64>,

        /// Walltime in minutes
        #[arg(long, default_value = "60")]
        walltime: u64,

        /// Opaque JSON handed to the job
        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// Add a stage-B (post-processing) job over a stage-A job
    AddB {
        /// Id of the stage-A job whose output is processed
        #[arg(long)]
        upstream: i64,

        /// Distinguishes several runs over the same upstream output
        #[arg(long)]
        run_key: String,

        #[arg(long)]
        priority: Option<i64>,

        /// Walltime in minutes
        #[arg(long, default_value = "60")]
        walltime: u64,

        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// List jobs
    List {
        #[arg(long)]
        kind: Option<KindArg>,

        #[arg(long)]
        status: Option<StatusArg>,

        #[arg(long, default_value = "100")]
        limit: i64,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// Put failed jobs back to created
    RetryFailed {
        /// Only this kind (default: both)
        #[arg(long)]
        kind: Option<KindArg>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "twostage=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn load_config(
    path: Option<&Path>,
    database: Option<String>,
) -> Result<SchedulerConfig, Box<dyn std::error::Error>> {
    let mut config = SchedulerConfig::load(path)?;
    if let Some(url) = database {
        config.database.url = url;
    }
    Ok(config)
}

async fn open_store(config: &SchedulerConfig) -> Result<JobStore, Box<dyn std::error::Error>> {
    let store = JobStore::connect(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    Ok(store)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(
    mut config: SchedulerConfig,
    args: ServeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(mode) = args.backend {
        config.backend.mode = mode.into();
    }
    if let Some(interval) = args.interval {
        config.submitter.interval_secs = interval;
    }
    if let Some(max_queued) = args.max_queued {
        config.submitter.max_queued_jobs = max_queued;
    }
    if let Some(host) = args.host {
        config.submitter.host = host;
    }
    if let Some(port) = args.port {
        config.submitter.port = port;
    }
    if args.dashboard_port.is_some() {
        config.dashboard_port = args.dashboard_port;
    }
    if let Some(max_workers) = args.max_workers {
        config.local.max_workers = max_workers;
    }

    tracing::info!(
        backend = ?config.backend.mode,
        interval_secs = config.submitter.interval_secs,
        max_queued_jobs = config.submitter.max_queued_jobs,
        report_to = %format!("{}:{}", config.submitter.host, config.submitter.port),
        "Starting twostage scheduler"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

fn print_added(kind: JobKind, id: i64, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            let out = serde_json::json!({ "kind": kind, "id": id });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => println!("Added {} job {}", kind, id),
    }
    Ok(())
}

fn print_jobs(jobs: &[Job], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<8} {:<8} {:<18} {:>8} {:>10} {:<20} UPSTREAM",
                "KIND", "ID", "STATUS", "PRIORITY", "DURATION", "LOCATION"
            );
            println!("{}", "-".repeat(88));
            for job in jobs {
                println!(
                    "{:<8} {:<8} {:<18} {:>8} {:>10} {:<20} {}",
                    job.kind(),
                    job.id,
                    job.status,
                    job.priority,
                    job.duration.map(|d| d.to_string()).unwrap_or_default(),
                    job.location.as_deref().unwrap_or("-"),
                    job.upstream_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
            println!();
            println!("Showing {} jobs", jobs.len());
        }
    }
    Ok(())
}

fn walltime_from_minutes(minutes: u64) -> Result<Duration, Box<dyn std::error::Error>> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("walltime of {minutes} minutes is too large").into())
}

async fn handle_job(
    store: &JobStore,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::AddA {
            priority,
            walltime,
            payload,
            output,
        } => {
            let id = store
                .insert_stage_a(NewStageA {
                    priority,
                    walltime: walltime_from_minutes(walltime)?,
                    payload,
                })
                .await?;
            print_added(JobKind::StageA, id, &output)?;
        }
        JobCommands::AddB {
            upstream,
            run_key,
            priority,
            walltime,
            payload,
            output,
        } => {
            let id = store
                .insert_stage_b(NewStageB {
                    upstream_ref: upstream,
                    run_key,
                    priority,
                    walltime: walltime_from_minutes(walltime)?,
                    payload,
                })
                .await?;
            print_added(JobKind::StageB, id, &output)?;
        }
        JobCommands::List {
            kind,
            status,
            limit,
            output,
        } => {
            let filter = JobFilter {
                kind: kind.map(Into::into),
                status: status.map(Into::into),
                limit: Some(limit),
            };
            let jobs = store.list_jobs(&filter).await?;
            print_jobs(&jobs, &output)?;
        }
        JobCommands::RetryFailed { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind.into()],
                None => JobKind::ALL.to_vec(),
            };
            for kind in kinds {
                let n = store.reset_failed(kind).await?;
                println!("Reset {} failed {} jobs to created", n, kind);
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
    init_logging(args.verbose);

    let config_path = args.config.as_deref();

    match args.command {
        Commands::Serve(serve_args) => {
            let config = load_config(config_path, args.database)?;
            run_server(config, serve_args).await?;
        }
        Commands::InitDb => {
            let config = load_config(config_path, args.database)?;
            open_store(&config).await?.close().await;
            println!("Database ready at {}", config.database.url);
        }
        Commands::Job { command } => {
            let config = load_config(config_path, args.database)?;
            let store = open_store(&config).await?;
            let result = handle_job(&store, command).await;
            store.close().await;
            result?;
        }
        Commands::Report {
            status,
            duration,
            result,
        } => {
            let reporter = StatusReporter::new(ReportContext::from_env()?);
            let ack = reporter.report(status.into(), duration, result).await?;
            if !ack.applied {
                tracing::warn!("Status report was acknowledged but not applied");
            }
        }
        Commands::Run { result, command } => {
            let reporter = StatusReporter::new(ReportContext::from_env()?);
            let mut command = command.into_iter();
            let program = command.next().ok_or("missing command")?;
            let status = run_reported(&reporter, program, command.collect(), result).await?;
            if status != JobStatus::Success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
