//! scanflow-pipeline - document classification service
//!
//! Consumes OCR, prediction, and event queues from the broker, classifies
//! documents, requests human feedback, and triggers retraining. Serves
//! `/health` over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scanflow_common::config::{
    resolve_root_folder, PipelineConfig, CONFIG_ENV_VAR, ROOT_FOLDER_ENV_VAR,
};
use scanflow_common::{EventBus, NotificationKind, PipelineEvent};
use scanflow_pipeline::registry::BuildContext;
use scanflow_pipeline::{AppState, Pipeline};
use tokio::signal;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for scanflow-pipeline
#[derive(Parser, Debug)]
#[command(name = "scanflow-pipeline")]
#[command(about = "Document OCR classification pipeline")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Root folder for the database and model files
    #[arg(short, long, env = ROOT_FOLDER_ENV_VAR)]
    root_folder: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        revision = env!("SCANFLOW_REVISION"),
        built_at = env!("SCANFLOW_BUILT_AT"),
        profile = env!("SCANFLOW_BUILD_PROFILE"),
        "Starting scanflow-pipeline"
    );

    // Root folder: CLI > env > config file > OS default
    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV_VAR,
        config.root_folder.as_deref(),
    );
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    info!("Root folder: {}", root_folder.display());

    let config = Arc::new(config);
    let events = EventBus::new(config.pipeline.event_bus_capacity);
    let last_error = Arc::new(RwLock::new(None));
    tokio::spawn(log_notifications(events.subscribe(), last_error.clone()));

    let ctx = BuildContext::new(config.clone(), root_folder, events.clone());
    let pipeline = Pipeline::build(ctx)
        .await
        .context("Failed to build pipeline")?;
    pipeline.start().await.context("Failed to start pipeline")?;

    let mut state = AppState::from_pipeline(&pipeline);
    state.last_error = last_error;

    if config.http.enabled {
        let listener = tokio::net::TcpListener::bind(&config.http.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.http.bind))?;
        info!("Health check: http://{}/health", config.http.bind);

        axum::serve(listener, scanflow_pipeline::build_router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;
    } else {
        shutdown_signal().await;
    }

    pipeline.shutdown().await.context("Failed to shut down cleanly")?;
    info!("Shutdown complete");
    Ok(())
}

/// Log operator notifications and remember the last failure for `/health`
async fn log_notifications(
    mut rx: broadcast::Receiver<PipelineEvent>,
    last_error: Arc<RwLock<Option<String>>>,
) {
    loop {
        match rx.recv().await {
            Ok(PipelineEvent::Notification { kind, message, .. }) => match kind {
                NotificationKind::Info => info!(notification = %message),
                NotificationKind::Warning => warn!(notification = %message),
                NotificationKind::Error => {
                    error!(notification = %message);
                    *last_error.write().await = Some(message);
                }
            },
            Ok(PipelineEvent::StageFailed {
                queue,
                message_type,
                reason,
                ..
            }) => {
                *last_error.write().await = Some(format!("{} on {}: {}", message_type, queue, reason));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notification log sink lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
