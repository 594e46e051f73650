//! Printline CLI
//!
//! Runs the scan-to-print pipeline once, or watches the scanner share and
//! runs it for every new scan.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use printline::cancellation::CancellationToken;
use printline::cloud::{CloudJobPoller, OpenScanCloudClient, PollPolicy};
use printline::config::PrintlineConfig;
use printline::core::RunStatus;
use printline::executor::{CommandExecutor, RemoteExecutor};
use printline::notify::{CommandNotifier, FanoutNotifier, LoggingNotifier, Notifier};
use printline::orchestrator::{JsonFileRunStore, Orchestrator, StepDispatcher};
use printline::steps::StepRegistry;
use printline::watcher::{ScanWatcher, SmbScanShare};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "printline")]
#[command(about = "Scan-to-print pipeline orchestrator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, env = "PRINTLINE_CONFIG", default_value = "printline.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once
    Run {
        /// Scan project; defaults to the most recent scan
        #[arg(long, short)]
        project: Option<String>,
    },
    /// Watch the scanner share and run the pipeline for new scans
    Watch {
        /// Poll interval in seconds; overrides [watcher] poll_interval_secs
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show one run record
    Status {
        /// Run id
        run_id: Uuid,
    },
    /// List run records
    Runs,
    /// Print the resolved step list
    Steps,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "printline=debug" } else { "printline=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

struct App {
    orchestrator: Orchestrator,
    share: Arc<SmbScanShare>,
    notifier: Arc<dyn Notifier>,
}

fn build(config: &PrintlineConfig) -> Result<App> {
    let executor: Arc<dyn CommandExecutor> = Arc::new(RemoteExecutor::from_config(&config.worker));
    let registry = StepRegistry::from_config(config).context("invalid step list")?;

    let api = OpenScanCloudClient::from_config(&config.cloud).context("cannot build cloud client")?;
    let poller = CloudJobPoller::new(Arc::new(api), PollPolicy::from_config(&config.cloud));

    let mut fanout = FanoutNotifier::new().with(Arc::new(LoggingNotifier));
    if config.notify.enabled {
        fanout = fanout.with(Arc::new(CommandNotifier::from_config(
            &config.notify,
            Arc::clone(&executor),
        )));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(fanout);

    let share = Arc::new(SmbScanShare::new(config.scanner.clone(), Arc::clone(&executor)));
    let orchestrator = Orchestrator::builder(registry, Arc::new(StepDispatcher::new(executor, poller)))
        .notifier(Arc::clone(&notifier))
        .store(Arc::new(JsonFileRunStore::new(config.paths.state_dir())))
        .lock_dir(config.paths.lock_dir())
        .resolver(share.clone())
        .build();

    Ok(App {
        orchestrator,
        share,
        notifier,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = PrintlineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let app = build(&config)?;

    match cli.command {
        Commands::Run { project } => {
            let handle = app.orchestrator.start_run(project).await?;
            let orchestrator = app.orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    orchestrator.shutdown("interrupted").await;
                }
            });
            let run = handle.wait().await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if run.status != RunStatus::Succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Watch { interval } => {
            let interval = interval.map_or_else(|| config.watcher_interval(), Duration::from_secs);
            let stop = Arc::new(CancellationToken::new());
            {
                let stop = Arc::clone(&stop);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        stop.cancel("interrupted");
                    }
                });
            }

            let mut watcher = ScanWatcher::new(
                app.share,
                Arc::new(app.orchestrator.clone()),
                app.notifier,
            )
            .baseline_existing(config.watcher.baseline_existing);
            watcher.run_forever(interval, &stop).await;

            let reason = stop.reason().unwrap_or_else(|| "watcher stopped".to_string());
            let aborted = app.orchestrator.shutdown(reason).await;
            if aborted > 0 {
                tracing::warn!(aborted, "runs in flight were aborted");
            }
        }
        Commands::Status { run_id } => {
            let run = app.orchestrator.get_status(run_id).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Runs => {
            for run in app.orchestrator.list_runs().await? {
                let failed_step = run
                    .last_error
                    .as_ref()
                    .and_then(|e| e.step_name.clone())
                    .unwrap_or_default();
                println!(
                    "{}  {:<24} {:<10} {}  {}",
                    run.run_id,
                    run.project_name,
                    run.status,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    failed_step
                );
            }
        }
        Commands::Steps => {
            for step in app.orchestrator.registry().steps() {
                println!(
                    "{:<14} {:<7} attempts={} timeout={}s{}",
                    step.name,
                    step.host_affinity,
                    step.attempts_allowed(),
                    step.timeout_secs,
                    if step.enabled { "" } else { " (disabled)" }
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
