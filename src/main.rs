use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use autoingest::config::MonitorConfig;
use autoingest::coordination::InMemoryCoordinationService;
use autoingest::events::LoopbackEventBus;
use autoingest::job::AutoIngestJob;
use autoingest::manifest::{JsonManifestParser, ManifestParser};
use autoingest::monitor::AutoIngestMonitor;
use autoingest::node_data::ProcessingStage;

#[derive(Parser, Debug)]
#[command(name = "autoingest")]
#[command(version)]
#[command(about = "Coordinated automated ingest of forensic data sources")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a monitor until interrupted
    Server(ServerArgs),

    /// Run one input scan and print the job views
    Scan(ScanArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    monitor: MonitorArgs,

    /// Also claim and process pending jobs (otherwise the monitor only
    /// maintains the views and recovers crashed jobs)
    #[arg(long)]
    process: bool,
}

#[derive(Parser, Debug)]
struct ScanArgs {
    #[command(flatten)]
    monitor: MonitorArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct MonitorArgs {
    /// Name this host publishes in job records and events
    #[arg(long, default_value = "localhost")]
    host_name: String,

    /// Directory to walk for new manifest files
    #[arg(long)]
    input_root: Option<PathBuf>,

    /// Root directory holding case output directories
    #[arg(long)]
    output_root: PathBuf,

    /// Seconds between automatic input scans
    #[arg(long, default_value = "60")]
    scan_interval: u64,

    /// Seconds between job status broadcasts
    #[arg(long, default_value = "10")]
    status_interval: u64,

    /// Times a crashed job is retried before giving up
    #[arg(long, default_value = "2")]
    max_retries: i32,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JobOutput {
    case_name: String,
    manifest: String,
    priority: i32,
    host: String,
    stage: String,
    errors_occurred: bool,
}

#[derive(Serialize)]
struct SnapshotOutput {
    pending: Vec<JobOutput>,
    running: Vec<JobOutput>,
    completed: Vec<JobOutput>,
}

impl From<&AutoIngestJob> for JobOutput {
    fn from(job: &AutoIngestJob) -> Self {
        Self {
            case_name: job.manifest.case_name.clone(),
            manifest: job.manifest_path().display().to_string(),
            priority: job.priority,
            host: job.host_name.clone(),
            stage: job.stage().display_text().to_string(),
            errors_occurred: job.errors_occurred,
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_config(args: &MonitorArgs) -> MonitorConfig {
    let mut config = MonitorConfig::new(&args.host_name, args.output_root.clone())
        .with_scan_interval(Duration::from_secs(args.scan_interval))
        .with_job_status_interval(Duration::from_secs(args.status_interval))
        .with_max_retries(args.max_retries);
    if let Some(input_root) = &args.input_root {
        config = config.with_input_root(input_root.clone());
    }
    config
}

fn start_monitor(config: MonitorConfig) -> AutoIngestMonitor {
    let coordination = Arc::new(InMemoryCoordinationService::new());
    let event_bus = Arc::new(LoopbackEventBus::default());
    let parsers: Vec<Box<dyn ManifestParser>> = vec![Box::new(JsonManifestParser)];
    AutoIngestMonitor::start_up(config, coordination, event_bus, parsers)
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args.monitor);
    tracing::info!(
        host = %config.host_name,
        input_root = ?config.input_root,
        output_root = %config.output_root.display(),
        process = args.process,
        "starting auto ingest monitor"
    );
    let monitor = start_monitor(config);

    if args.process {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = process_jobs(&monitor) => {}
        }
    } else {
        shutdown_signal().await;
    }

    monitor.shut_down().await;
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives; the caller then drains the
/// monitor so the current job's record and lock are finalized together.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down auto ingest monitor");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down auto ingest monitor");
        }
    }
}

/// A minimal processing driver: claims one job at a time and walks it
/// through the ingest stages. Real ingest work plugs in here.
async fn process_jobs(monitor: &AutoIngestMonitor) {
    loop {
        match monitor.claim_next_job().await {
            Ok(Some(job)) => {
                tracing::info!(
                    case = %job.manifest.case_name,
                    data_source = %job.manifest.data_source_file_name(),
                    "processing job"
                );
                for stage in [
                    ProcessingStage::OpeningCase,
                    ProcessingStage::AddingDataSource,
                    ProcessingStage::AnalyzingDataSource,
                ] {
                    if job.cancel_token().is_cancelled() {
                        break;
                    }
                    if let Err(err) = monitor.set_current_job_stage(stage).await {
                        tracing::error!(%err, "failed to update job stage");
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                let errors = job.cancel_token().is_cancelled();
                if let Err(err) = monitor.complete_current_job(errors, false).await {
                    tracing::error!(%err, "failed to finalize job");
                }
            }
            Ok(None) => tokio::time::sleep(Duration::from_secs(5)).await,
            Err(err) => {
                tracing::error!(%err, "failed to claim a job, backing off");
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    }
}

async fn run_scan(args: ScanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args.monitor);
    let monitor = start_monitor(config);
    monitor.scan_and_wait().await?;
    let snapshot = monitor.snapshot().await;
    monitor.shut_down().await;

    let output = SnapshotOutput {
        pending: snapshot.pending.iter().map(JobOutput::from).collect(),
        running: snapshot.running.iter().map(JobOutput::from).collect(),
        completed: snapshot.completed.iter().map(JobOutput::from).collect(),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            print_jobs("PENDING", &output.pending);
            print_jobs("RUNNING", &output.running);
            print_jobs("COMPLETED", &output.completed);
        }
    }
    Ok(())
}

fn print_jobs(heading: &str, jobs: &[JobOutput]) {
    println!("{heading} ({})", jobs.len());
    println!("{}", "-".repeat(78));
    for job in jobs {
        println!(
            "{:<20} {:<8} {:<24} {:<12} {}",
            job.case_name,
            job.priority,
            job.host,
            job.stage,
            job.manifest
        );
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Scan(scan_args) => run_scan(scan_args).await?,
    }
    Ok(())
}
