use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_service::config::Config;
use telemetry_service::{
    start_api_server, AppState, Database, FilesystemBlobStore, FrameClassifier, IngestionService,
    LiveSnapshots, RetentionThrottle, SensorStore, SqliteFrameStore, TimelapseReconstructor, UserStore,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        min_interval_secs = config.retention.min_interval_secs,
        brightness_threshold = config.retention.brightness_threshold,
        "Starting greenhouse telemetry service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let database = Database::connect(&config.database)
        .await
        .context("Failed to initialize database")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        database
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = FilesystemBlobStore::new(&config.storage);
    blob_store
        .initialize()
        .await
        .context("Failed to initialize blob store")?;
    let uploads_root = PathBuf::from(blob_store.root());

    let users = UserStore::new(database.pool().clone());
    let (admin, key_generated) = users
        .ensure_admin(&config.seed.admin_username, config.seed.admin_api_key.clone())
        .await
        .context("Failed to provision administrator account")?;
    if key_generated {
        warn!(
            username = %admin.username,
            "Generated an API key for the new administrator account; read it from the users table or set seed.admin_api_key"
        );
    }

    let frames = SqliteFrameStore::new(database.pool().clone());
    let blobs = Arc::new(blob_store);

    let ingestion = Arc::new(IngestionService::new(
        FrameClassifier::new(config.retention.brightness_threshold),
        RetentionThrottle::new(config.retention.min_interval()),
        Arc::new(frames.clone()),
        blobs.clone(),
        Arc::new(LiveSnapshots::new()),
    ));

    let timelapse = Arc::new(TimelapseReconstructor::with_step(
        Arc::new(frames.clone()),
        config.timelapse.step(),
    ));

    // Create API state
    let api_state = AppState {
        database: database.clone(),
        users,
        frames,
        sensors: SensorStore::new(database.pool().clone()),
        blobs,
        ingestion,
        timelapse,
        timelapse_timeout: config.timelapse_timeout(),
        uploads_root,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Telemetry service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down telemetry service");

    api_handle.abort();
    database.pool().close().await;

    info!("Telemetry service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
