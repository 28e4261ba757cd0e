// Worker process entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collection::{
    ApiCollector, CollectorRegistry, DatabaseCollector, FileSink, MongoSink, PostgresSink,
    RpaCollector, SessionCache, SinkRegistry,
};
use worker_core::{
    worker_identity, PostgresJobStore, Scheduler, SchedulerConfig, WorkerConfig, WorkerMetrics,
};

/// Wait this long for in-flight attempts after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "worker", about = "Data collection worker")]
struct Cli {
    /// Path to the worker YAML configuration.
    #[arg(long, default_value = "config/worker.yaml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug,collection=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::load(&cli.config).context("failed to load configuration")?;
    info!(worker_type = %config.worker_type, "configuration loaded");

    // Control database; unreachable is a fatal init error.
    let control_pool = PgPoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .max_lifetime(Duration::from_secs(300))
        .connect(&config.database.url())
        .await
        .context("failed to connect to control database")?;
    info!("control database connected");

    let sessions = Arc::new(SessionCache::new());

    let mut collectors = CollectorRegistry::new();
    collectors.register(Arc::new(ApiCollector::new(config.collector.api.timeout_secs)));
    collectors.register(Arc::new(DatabaseCollector::new()));
    collectors.register(Arc::new(RpaCollector::new(
        config.collector.rpa.headless,
        sessions.clone(),
    )));

    let mut sinks = SinkRegistry::new();
    sinks.register(Arc::new(FileSink::new(&config.storage.file_base_path)));

    if let Some(pg) = &config.storage.postgres {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&pg.url())
            .await
            .context("failed to connect to postgres storage")?;
        sinks.register(Arc::new(PostgresSink::new(pool)));
        info!("postgres sink registered");
    }

    if let Some(mongo) = &config.storage.mongodb {
        let sink = MongoSink::connect(&mongo.uri, mongo.database.clone())
            .await
            .context("failed to connect to mongodb storage")?;
        sinks.register(Arc::new(sink));
        info!("mongodb sink registered");
    }

    let metrics = Arc::new(WorkerMetrics::new().context("failed to build metrics")?);
    let identity = worker_identity();

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(PostgresJobStore::new(control_pool)),
        Arc::new(collectors),
        Arc::new(sinks),
        metrics,
        SchedulerConfig {
            worker_type: config.worker_type.clone(),
            poll_interval: config.poll_interval(),
            worker_identity: identity.clone(),
            default_storage_target: config.storage.default_target.clone(),
            collected_database: config.storage.collected_database.clone(),
        },
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let run_shutdown = shutdown.clone();
    let run_scheduler = scheduler.clone();
    let mut scheduler_task =
        tokio::spawn(async move { run_scheduler.run(run_shutdown).await });

    tokio::select! {
        result = &mut scheduler_task => {
            result.context("scheduler task panicked")??;
        }
        _ = shutdown.cancelled() => {
            info!("shutting down, draining in-flight work");
            match tokio::time::timeout(DRAIN_DEADLINE, &mut scheduler_task).await {
                Ok(result) => {
                    result.context("scheduler task panicked")??;
                }
                Err(_) => {
                    warn!("drain deadline exceeded, aborting scheduler");
                    scheduler_task.abort();
                }
            }
        }
    }

    sessions.clear();
    info!(worker = %identity, "worker stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        shutdown.cancel();
    });
}
