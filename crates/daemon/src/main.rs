//! Freshet daemon - Main Entry Point
//! Scheduler loop + maintenance + diagnostics over a SQLite store

mod logging;
mod settings;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use freshet_core::application::worker::constants::DEFAULT_HISTORY_LIMIT;
use freshet_core::application::{
    shutdown_channel, ConcurrencyGates, DiagnosticsService, DocumentBatcher, JobWorker,
    MaintenanceScheduler, Scheduler, SchedulerConfig, SchedulerPorts, ShutdownSender,
    StartupRecovery, TaskOutcome, TaskRunner,
};
use freshet_core::domain::{DataDomain, JobStatus};
use freshet_core::port::id_provider::UuidProvider;
use freshet_core::port::time_provider::SystemTimeProvider;
use freshet_core::port::{EntityRegistry, FetcherRegistry, JobStore, RunRecorder, TimeProvider};
use freshet_infra_sqlite::{
    create_pool, current_version, run_migrations, SqliteDocumentStore, SqliteEntityRegistry,
    SqliteJobStore, SqliteMaintenance,
};
use freshet_infra_system::{
    CommandDocumentSource, CommandFetcher, CommandRunner, CommandSummarizer, SystemProbeImpl,
};

use crate::settings::{parse_domain, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "freshetd")]
#[command(about = "Freshet background refresh orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file layered over the built-in defaults
    #[arg(short, long, env = "FRESHET_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until SIGINT/SIGTERM (default)
    Run,

    /// Print recent runs and job counts from the database as JSON
    Status {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = logging::init_logging(&settings.logging, settings.log_dir()?.as_deref())?;
            run_daemon(settings).await
        }
        Commands::Status { limit } => print_status(&settings, limit).await,
    }
}

async fn run_daemon(settings: Settings) -> Result<()> {
    info!("Freshet v{} starting...", VERSION);

    let config = settings.scheduler_config()?;
    let ttls = settings.ttl_table()?;

    // 1. Database
    let db_url = settings.database_url()?;
    if db_url != "sqlite::memory:" {
        if let Some(parent) = settings.database_path()?.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }
    info!(db_url = %db_url, "Initializing database...");
    let pool = create_pool(&db_url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 2. Adapters (DI wiring)
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = Arc::new(SqliteJobStore::new(pool.clone(), time_provider.clone()));
    let registry = Arc::new(SqliteEntityRegistry::new(pool.clone(), time_provider.clone()));
    let documents = Arc::new(SqliteDocumentStore::new(pool.clone(), time_provider.clone()));

    for entity in &settings.entities {
        registry.track(entity).await?;
    }

    let (shutdown_tx, shutdown) = shutdown_channel();
    let runner = TaskRunner::new();
    let gates = Arc::new(ConcurrencyGates::new(
        config.max_concurrent,
        config.heavy_job_limit,
    )?);

    let fetchers = build_fetchers(
        &settings,
        &config,
        time_provider.clone(),
        documents.clone(),
        &runner,
        &shutdown_tx,
    )?;
    for domain in ttls.domains() {
        if !fetchers.contains(domain) {
            warn!(domain = %domain, "Domain is scheduled but has no fetcher; its jobs will fail");
        }
    }

    // 3. Crash recovery (before any claim)
    let recovery = StartupRecovery::new(
        store.clone(),
        registry.clone(),
        documents.clone(),
        config.template_version,
    );
    let report = recovery.recover().await.context("Startup recovery failed")?;
    info!(
        orphans_reset = report.orphans_reset,
        summaries_rearmed = report.summaries_rearmed,
        "Startup recovery completed"
    );

    // 4. Scheduler
    let worker = Arc::new(JobWorker::new(
        store.clone(),
        registry.clone(),
        fetchers,
        gates.clone(),
        runner.clone(),
        time_provider.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        ttls,
        SchedulerPorts {
            registry: registry.clone(),
            store: store.clone(),
            recorder: store.clone(),
            time_provider: time_provider.clone(),
            id_provider: Arc::new(UuidProvider),
        },
        worker,
        runner.clone(),
    )?);

    info!("Starting scheduler...");
    let scheduler_handle = runner.spawn("scheduler-loop", scheduler.run(shutdown.clone()));

    // 5. Maintenance
    let maintenance_scheduler = MaintenanceScheduler::new(
        Arc::new(SqliteMaintenance::new(pool.clone(), time_provider.clone())),
        settings.maintenance_config(),
        settings.maintenance.interval_hours,
        runner.clone(),
    );
    let maintenance_handle = runner.spawn(
        "maintenance-loop",
        maintenance_scheduler.run(shutdown_tx.subscribe()),
    );

    // 6. Periodic diagnostics
    let diagnostics = DiagnosticsService::new(
        store.clone(),
        store.clone(),
        gates,
        runner.clone(),
        Arc::new(SystemProbeImpl::new()),
    );
    let diagnostics_handle = runner.spawn(
        "diagnostics-loop",
        diagnostics.run(
            Duration::from_secs(settings.diagnostics.interval_secs.max(1)),
            settings.diagnostics.history_limit,
            shutdown_tx.subscribe(),
        ),
    );

    info!("System ready. Press Ctrl+C to shutdown");

    // 7. Wait for shutdown signal
    let signal = wait_for_signal().await?;
    info!(signal = signal, "Shutdown signal received. Draining...");

    // 8. Graceful shutdown
    shutdown_tx.shutdown();
    if let Some(Err(e)) = loop_exit("scheduler-loop", scheduler_handle.await) {
        error!(error = %e, "Scheduler stopped with error");
    }
    loop_exit("maintenance-loop", maintenance_handle.await);
    loop_exit("diagnostics-loop", diagnostics_handle.await);

    if runner.drain(config.drain_timeout).await {
        info!("All tasks finished");
    } else {
        warn!(
            active_tasks = runner.active_tasks(),
            "Drain timed out; unfinished jobs stay running until the next start resets them"
        );
    }

    pool.close().await;
    info!("Shutdown complete.");
    Ok(())
}

/// Domain -> fetcher table from `[fetchers]`
fn build_fetchers(
    settings: &Settings,
    config: &SchedulerConfig,
    time_provider: Arc<dyn TimeProvider>,
    documents: Arc<SqliteDocumentStore>,
    runner: &TaskRunner,
    shutdown_tx: &ShutdownSender,
) -> Result<FetcherRegistry> {
    let commands = Arc::new(CommandRunner::new(
        time_provider,
        settings.fetchers.env_allowlist.clone(),
    ));
    let mut fetchers = FetcherRegistry::new();

    for (name, spec) in &settings.fetchers.commands {
        let domain = parse_domain(name)?;
        if domain == DataDomain::DocumentSummaries && settings.fetchers.documents.is_some() {
            bail!("document_summaries has both a command and a [fetchers.documents] pipeline");
        }
        info!(domain = %domain, program = %spec.program, "Registered command fetcher");
        fetchers = fetchers.register(
            domain,
            Arc::new(CommandFetcher::new(commands.clone(), spec.clone())),
        );
    }

    if let Some(pipeline) = &settings.fetchers.documents {
        let batcher = DocumentBatcher::new(
            Arc::new(CommandDocumentSource::new(
                commands.clone(),
                pipeline.list.clone(),
                pipeline.load.clone(),
                shutdown_tx.subscribe(),
            )),
            Arc::new(CommandSummarizer::new(
                commands.clone(),
                pipeline.summarize.clone(),
                shutdown_tx.subscribe(),
            )),
            documents.clone(),
            documents,
            runner.clone(),
            config.batch_size,
            config.template_version,
        );
        info!(
            batch_size = config.batch_size,
            template_version = config.template_version,
            "Registered document summary pipeline"
        );
        fetchers = fetchers.register(DataDomain::DocumentSummaries, Arc::new(batcher));
    }

    Ok(fetchers)
}

/// Log how a background loop ended; `None` if it died instead of returning
fn loop_exit<T>(name: &str, joined: std::result::Result<TaskOutcome<T>, JoinError>) -> Option<T> {
    match joined {
        Ok(outcome) => match outcome.into_result() {
            Ok(value) => {
                info!(task = name, "Background loop stopped");
                Some(value)
            }
            Err(msg) => {
                error!(task = name, error = %msg, "Background loop died");
                None
            }
        },
        Err(e) => {
            error!(task = name, error = %e, "Background loop did not finish");
            None
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Read-only: works without a running daemon
async fn print_status(settings: &Settings, limit: usize) -> Result<()> {
    let db_url = settings.database_url()?;
    if db_url == "sqlite::memory:" {
        bail!("status needs a file database");
    }
    let path = settings.database_path()?;
    if !path.exists() {
        bail!("Database {} does not exist (start freshetd once)", path.display());
    }

    let pool = create_pool(&db_url).await.context("Cannot open database")?;
    let schema_version = current_version(&pool).await?;
    if schema_version == 0 {
        bail!("Database {} has no Freshet schema", path.display());
    }

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = SqliteJobStore::new(pool.clone(), time_provider.clone());
    let registry = SqliteEntityRegistry::new(pool.clone(), time_provider);

    let mut jobs_by_status = BTreeMap::new();
    for status in [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ] {
        jobs_by_status.insert(status.as_str(), store.count_by_status(status).await?);
    }

    let report = json!({
        "schema_version": schema_version,
        "tracked_entities": registry.list_tracked_entities().await?.len(),
        "jobs_by_status": jobs_by_status,
        "recent_runs": store.list_run_history(limit).await?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.close().await;
    Ok(())
}
