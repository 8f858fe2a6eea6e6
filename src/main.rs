use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skeenode::api::{self, ApiState, Validator};
use skeenode::config::Config;
use skeenode::coordination::{
    node_identity, Coordinator, PostgresCoordinator, SCHEDULER_ELECTION,
};
use skeenode::error::Result;
use skeenode::executor::{Executor, ExecutorConfig};
use skeenode::logstore::LocalLogStore;
use skeenode::metrics::Metrics;
use skeenode::predictor::HttpPredictor;
use skeenode::queue::{PostgresQueue, Queue, EXECUTOR_GROUP};
use skeenode::scheduler::{Core, CoreOptions};
use skeenode::store::{postgres, PostgresStore};

#[derive(Parser, Debug)]
#[command(name = "skeenode")]
#[command(about = "A distributed cron-style job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the admin API server
    Api,
    /// Run the leader-elected scheduler
    Scheduler,
    /// Run an executor worker node
    Executor,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let result = match cli.command {
        Command::Api => run_api(config).await,
        Command::Scheduler => run_scheduler(config).await,
        Command::Executor => run_executor(config).await,
        Command::Migrate => run_migrate(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run_api(config: Config) -> Result<()> {
    let pool = postgres::connect(&config).await?;
    tracing::info!("Postgres connected");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let queue = Arc::new(PostgresQueue::new(pool.clone()));
    let coordinator = Arc::new(PostgresCoordinator::new(pool));
    let election = coordinator.election(SCHEDULER_ELECTION, config.leader_election_ttl);

    let state = ApiState {
        jobs: store.clone(),
        executions: store,
        queue,
        coordinator,
        election,
        metrics: Arc::new(Metrics::new()),
        validator: Arc::new(Validator::default()),
    };

    let addr: SocketAddr = format!("0.0.0.0:{}", config.api_port)
        .parse()
        .map_err(|e| skeenode::error::SkeeError::Config(format!("invalid API address: {e}")))?;
    let cancel = skeenode::shutdown::install();
    api::serve(addr, state, cancel).await
}

async fn run_scheduler(config: Config) -> Result<()> {
    let pool = postgres::connect(&config).await?;
    tracing::info!("Postgres connected");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let queue = Arc::new(PostgresQueue::new(pool.clone()));
    let coordinator = Arc::new(PostgresCoordinator::new(pool));
    let election = coordinator.election(SCHEDULER_ELECTION, config.leader_election_ttl);
    let predictor = Arc::new(HttpPredictor::new(config.ai_service_url.clone()));
    let metrics = Arc::new(Metrics::new());

    let cancel = skeenode::shutdown::install();
    let identity = node_identity();
    tracing::info!(identity = %identity, "Requesting leadership");
    tokio::select! {
        result = election.campaign(&identity) => result?,
        _ = cancel.cancelled() => {
            tracing::info!("Shutdown before leadership was acquired");
            return Ok(());
        }
    }
    tracing::info!(identity = %identity, "Leadership acquired");

    let mut options = CoreOptions::new(identity);
    options.dispatch_interval = config.scheduler_interval;
    options.reconcile_interval = config.reconcile_interval;
    let core = Core::new(
        options,
        store.clone(),
        store,
        queue,
        coordinator,
        predictor,
        metrics,
    );

    core.run(election.clone(), cancel).await;

    // Resign so a follower takes over without waiting for lease expiry.
    if let Err(e) = election.resign().await {
        tracing::warn!(error = %e, "Failed to resign leadership");
    } else {
        tracing::info!("Leadership resigned");
    }
    Ok(())
}

async fn run_executor(config: Config) -> Result<()> {
    let pool = postgres::connect(&config).await?;
    tracing::info!("Postgres connected");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let queue: Arc<dyn Queue> = Arc::new(PostgresQueue::new(pool.clone()));
    let coordinator = Arc::new(PostgresCoordinator::new(pool));
    let logs = Arc::new(LocalLogStore::new(config.log_dir.clone()).await?);

    queue.ensure_group(EXECUTOR_GROUP).await?;

    let executor = Executor::new(
        ExecutorConfig::default(),
        coordinator,
        queue,
        store.clone(),
        store,
        logs,
        Arc::new(Metrics::new()),
    );

    let cancel = skeenode::shutdown::install();
    executor.run(cancel).await;
    Ok(())
}

async fn run_migrate(config: Config) -> Result<()> {
    let pool = postgres::connect(&config).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| skeenode::error::SkeeError::Internal(format!("migration failed: {e}")))?;
    tracing::info!("Migrations applied");
    Ok(())
}
