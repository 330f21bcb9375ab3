use axum::{routing::get, Router};
use clap::Parser;
use device_monitor::config::Config;
use device_monitor::db::PgDeviceStore;
use device_monitor::pool::WorkerPool;
use device_monitor::store::DeviceStore;
use device_monitor::{metrics, mqtt, rest, sweeper};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(2);
    }

    info!("Starting device monitor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let store: Arc<dyn DeviceStore> = match PgDeviceStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };
    info!("HTTP server listening on {}", config.http_addr);

    let cancel = CancellationToken::new();
    let processing = config.processing();
    let mqtt_config = config.mqtt();
    let mut tasks = JoinSet::new();

    let pool = WorkerPool::start(Arc::clone(&store), processing.clone(), config.pool());
    tasks.spawn({
        let (mqtt_config, processing, cancel) =
            (mqtt_config.clone(), processing.clone(), cancel.clone());
        async move {
            if let Err(e) =
                mqtt::run_telemetry_listener(mqtt_config, processing, pool, cancel).await
            {
                error!("Telemetry listener failed: {}", e);
            }
            "telemetry listener"
        }
    });

    tasks.spawn({
        let (store, cancel) = (Arc::clone(&store), cancel.clone());
        async move {
            if let Err(e) =
                mqtt::run_heartbeat_listener(mqtt_config, processing, store, cancel).await
            {
                error!("Heartbeat listener failed: {}", e);
            }
            "heartbeat listener"
        }
    });

    tasks.spawn({
        let (store, sweep, cancel) = (Arc::clone(&store), config.sweep(), cancel.clone());
        async move {
            sweeper::run_sweeper(store, sweep, cancel).await;
            "sweeper"
        }
    });

    // Build HTTP app with the device API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(Arc::clone(&store)));
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("HTTP server error: {}", e);
            }
            "HTTP server"
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok(name) => error!("{} terminated", name),
                Err(e) => error!("Task failed: {}", e),
            }
        }
    }

    info!("Shutting down, draining in-flight work");
    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(finished) = tasks.join_next().await {
            if let Ok(name) = finished {
                info!("{} stopped", name);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "Shutdown grace period of {:?} elapsed, abandoning remaining work",
            SHUTDOWN_GRACE
        );
    }

    store.close().await;
    info!("Shutdown complete");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
