use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docjobs_core::ToolRegistry;
use docjobs_db::{JobStore, MemoryJobStore, PgJobStore};
use docjobs_events::{EventBus, WebhookDispatcher, WebhookRegistry};
use docjobs_worker::{
    cleanup, CommandTool, JobOrchestrator, LocalOutputStorage, OutputStorage, PoolOptions,
    WorkerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docjobs_worker=debug,docjobs_events=info".into()),
        )
        .with(config.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    tracing::info!(
        pool_size = config.pool_size,
        queue_capacity = config.queue_capacity,
        output_dir = %config.output_dir.display(),
        "Loaded worker configuration"
    );

    // --- Job store ---
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let pool = docjobs_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            docjobs_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    // --- Tools ---
    let storage: Arc<dyn OutputStorage> = Arc::new(LocalOutputStorage::new(config.output_dir.clone()));
    let tools = ToolRegistry::builder()
        .register_remaining(Arc::new(CommandTool::new(
            config.tool_runner.clone(),
            Arc::clone(&storage),
            config.tool_timeout,
        )))
        .build()
        .context("Tool registry is incomplete")?;
    tracing::info!(tools = tools.len(), runner = %config.tool_runner, "Tool registry built");

    // --- Event bus and webhooks ---
    let bus = Arc::new(EventBus::default());
    let webhooks = Arc::new(WebhookRegistry::new());
    let dispatcher = WebhookDispatcher::new(webhooks, config.dispatcher())
        .context("Failed to build webhook dispatcher")?;
    let dispatcher_handle = dispatcher.spawn(bus.subscribe());

    // --- Orchestrator ---
    let orchestrator = JobOrchestrator::start(
        store,
        tools,
        Arc::clone(&bus),
        storage,
        PoolOptions {
            size: config.pool_size,
            queue_capacity: config.queue_capacity,
            retry: config.retry_policy(),
        },
    );

    // --- Retention cleaner ---
    let cleaner_cancel = CancellationToken::new();
    let cleaner_handle = tokio::spawn(cleanup::run(
        Arc::clone(&orchestrator),
        config.retention_days,
        config.cleanup_interval,
        cleaner_cancel.clone(),
    ));

    tracing::info!("Worker started");
    shutdown_signal().await;

    // --- Shutdown ---
    cleaner_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), cleaner_handle).await;
    tracing::info!("Retention cleaner stopped");

    orchestrator.shutdown(config.shutdown_timeout).await;

    dispatcher.shutdown(config.shutdown_timeout).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), dispatcher_handle).await;
    tracing::info!("Webhook dispatcher stopped");
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
