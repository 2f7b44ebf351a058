use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cadence_core::app::{HealthReporter, RunExit, SchedulerBuilder, TerminationSignal};
use cadence_core::config::SchedulerConfig;
use cadence_core::domain::GroupName;
use cadence_core::impls::{
    JsonFilePauseSource, MemoryHistory, MemoryLeaseStore, MemoryStateStore, RefreshingPauseList,
    SqliteBackend, StaticPauseSource, TokioProcessRunner,
};
use cadence_core::ports::{Clock, HistoryRecorder, Lease, PauseSource, StateStore, SystemClock};

#[derive(Parser)]
#[command(name = "cadence", version, about = "Lease-coordinated task group scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until the max runtime is reached or a signal arrives
    Run(RunArgs),
    /// Validate a config file and print each group's next due time
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the health report from the shared database as JSON
    Health {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        database: PathBuf,
    },
    /// Stop launching a task group for a while
    Pause {
        #[arg(long)]
        database: PathBuf,

        #[arg(long)]
        group: String,

        #[arg(long, default_value_t = 60)]
        minutes: i64,
    },
    /// Lift a pause before it expires
    Resume {
        #[arg(long)]
        database: PathBuf,

        #[arg(long)]
        group: String,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,

    /// SQLite file shared by every controller on this host (lease, state, history, pauses).
    /// Without it the controller keeps everything in memory and coordinates with nobody.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Working directory for step commands (defaults to the current directory)
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// JSON file mapping group names to a paused-until instant (overrides the database pauses)
    #[arg(long)]
    pause_file: Option<PathBuf>,

    #[arg(long)]
    max_runtime_secs: Option<u64>,

    #[arg(long)]
    lease_check_interval_secs: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { config } => check(&config),
        Command::Health { config, database } => health(&config, &database).await,
        Command::Pause {
            database,
            group,
            minutes,
        } => pause(&database, &group, minutes).await,
        Command::Resume { database, group } => resume(&database, &group).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cadence=info,cadence_core=info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = SchedulerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(secs) = args.max_runtime_secs {
        config.controller.max_runtime_secs = secs;
    }
    if let Some(secs) = args.lease_check_interval_secs {
        config.controller.lease_check_interval_secs = secs;
    }
    let settings = config.controller.clone();
    let groups = config.task_groups().context("validating task groups")?;

    let working_dir = match args.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving working directory")?,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = match &args.database {
        Some(path) => Storage::shared(path, &settings.lease_name, settings.lease_ttl(), &clock)?,
        None => {
            tracing::warn!(
                "no --database given; state and history live in memory and other controllers are not seen"
            );
            Storage::in_memory(&settings.lease_name, settings.lease_ttl(), &clock)
        }
    };
    let pause_source: Arc<dyn PauseSource> = match args.pause_file {
        Some(path) => Arc::new(JsonFilePauseSource::new(path)),
        None => storage.pauses.clone(),
    };

    let mut scheduler = SchedulerBuilder::new()
        .task_groups(groups)
        .options(settings.options())
        .clock(clock.clone())
        .lease(storage.lease)
        .state_store(storage.state_store)
        .pause_list(Arc::new(RefreshingPauseList::with_refresh_interval(
            pause_source,
            clock.clone(),
            settings.pause_refresh(),
        )))
        .process_runner(Arc::new(TokioProcessRunner::new(working_dir)))
        .history(storage.history)
        .build()?;

    tokio::spawn(forward_shutdown(scheduler.termination_signal()));

    tracing::info!(
        lease = %settings.lease_name,
        max_runtime_secs = settings.max_runtime_secs,
        "cadence starting"
    );
    let report = scheduler.run().await;
    tracing::info!(
        became_primary = report.became_primary,
        ticks = report.ticks,
        exit = ?report.exit,
        "cadence stopped"
    );

    // メモリ上の履歴はこのプロセスの分しかないので、共有 DB のときだけ評価する
    if args.database.is_some() {
        let health = scheduler.health_state().await?;
        tracing::info!(
            status = health.http_status(),
            status_name = health.status_name(),
            missing = %serde_json::to_string(&health.missing)?,
            "health"
        );
    }

    if let RunExit::Failed(message) = report.exit {
        anyhow::bail!("primary loop failed: {message}");
    }
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = SchedulerConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let groups = config.task_groups().context("validating task groups")?;

    let now = Utc::now();
    for group in groups.all() {
        let steps: Vec<&str> = group.step_names().map(|s| s.as_str()).collect();
        println!(
            "{}\t{}\t{}\tsteps={}\tnext={}",
            group.name(),
            if group.is_enabled() { "enabled" } else { "disabled" },
            group.schedule(),
            steps.join(","),
            group.next_due_after(now).to_rfc3339(),
        );
    }
    Ok(())
}

/// lease / state / history / pause の置き場所
struct Storage {
    lease: Arc<dyn Lease>,
    state_store: Arc<dyn StateStore>,
    history: Arc<dyn HistoryRecorder>,
    pauses: Arc<dyn PauseSource>,
}

impl Storage {
    fn shared(
        path: &Path,
        lease_name: &str,
        lease_ttl: Duration,
        clock: &Arc<dyn Clock>,
    ) -> Result<Self> {
        let backend = SqliteBackend::open(path)?;
        Ok(Self {
            lease: Arc::new(backend.lease(lease_name, lease_ttl, clock.clone())),
            state_store: Arc::new(backend.state_store(clock.clone())),
            history: Arc::new(backend.clone()),
            pauses: Arc::new(backend),
        })
    }

    fn in_memory(lease_name: &str, lease_ttl: Duration, clock: &Arc<dyn Clock>) -> Self {
        Self {
            lease: Arc::new(MemoryLeaseStore::new(clock.clone()).lease(lease_name, lease_ttl)),
            state_store: Arc::new(MemoryStateStore::new(clock.clone())),
            history: Arc::new(MemoryHistory::new()),
            pauses: Arc::new(StaticPauseSource::new()),
        }
    }
}

async fn health(config_path: &Path, database: &Path) -> Result<()> {
    let config = SchedulerConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let groups = config.task_groups().context("validating task groups")?;
    let backend = SqliteBackend::open(database)?;

    let reporter = HealthReporter::new(
        groups.into_definitions(),
        Arc::new(backend),
        Arc::new(SystemClock),
    );
    let report = reporter.health_state().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_healthy {
        anyhow::bail!("{} ({})", report.status_name(), report.http_status());
    }
    Ok(())
}

async fn pause(database: &Path, group: &str, minutes: i64) -> Result<()> {
    if minutes <= 0 {
        anyhow::bail!("--minutes must be greater than zero");
    }
    let until = TimeDelta::try_minutes(minutes)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .context("--minutes is out of range")?;
    SqliteBackend::open(database)?
        .pause(&GroupName::new(group), until)
        .await?;
    println!("{group} paused until {}", until.to_rfc3339());
    Ok(())
}

async fn resume(database: &Path, group: &str) -> Result<()> {
    SqliteBackend::open(database)?
        .resume(&GroupName::new(group))
        .await?;
    println!("{group} resumed");
    Ok(())
}

async fn forward_shutdown(signal: TerminationSignal) {
    shutdown_signal().await;
    tracing::info!("termination requested; finishing current iteration");
    signal.signal();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
