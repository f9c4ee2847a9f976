use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor::adapters::Adapters;
use conveyor::cli::{run_command, Cli};
use conveyor::config::Config;
use conveyor::engine::{DeploymentOrchestrator, PipelineEngine};
use conveyor::notifications::NotificationService;
use conveyor::queue::JobQueue;
use conveyor::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.command.is_some() {
        return run_command(&cli).await;
    }

    let config = Config::load(&cli.config)?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting conveyor v{}", env!("CARGO_PKG_VERSION"));

    for problem in config.check() {
        tracing::warn!(problem = %problem, "Configuration problem");
    }

    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.server.data_dir.display()
        )
    })?;

    let db = conveyor::db::init(&config.server.data_dir).await?;

    let adapters = Adapters::from_config(&config).await;
    let queue = JobQueue::new(db.clone(), &config.queue);
    let notifier = Arc::new(NotificationService::new());

    let deployments = Arc::new(DeploymentOrchestrator::new(
        db.clone(),
        adapters.clone(),
        queue.clone(),
        notifier.clone(),
        config.deployment.clone(),
    ));
    let pipelines = Arc::new(PipelineEngine::new(
        db.clone(),
        adapters,
        deployments.strategies(),
        queue.clone(),
        notifier,
        config.pipeline.clone(),
    ));

    deployments.start().await?;
    pipelines.start().await?;

    let metrics_handle = conveyor::api::metrics::init_metrics()?;
    let state = Arc::new(
        AppState::new(config.clone(), db, queue.clone(), deployments, pipelines)
            .with_metrics(metrics_handle),
    );

    let app = conveyor::api::create_router(state);

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind {}", api_addr))?;

    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
