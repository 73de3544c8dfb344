use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use federated_query::api::handlers::AppState;
use federated_query::api::routes::create_router;
use federated_query::config::Config;
use federated_query::services::database::{
    create_postgres_adapter, AnalyticalAdapter, AnalyticalConfig, DatabaseAdapter,
};
use federated_query::services::{ExecutionConfig, ExecutionService, MetricsReporter, PoolMonitor};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.style.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration before logging so the log style can be configured
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config);
    info!("Starting server on {}", config.server_address());

    let pool_monitor = Arc::new(PoolMonitor::new("postgres"));
    let warehouse = AnalyticalAdapter::new(AnalyticalConfig::default());
    if let Err(e) = warehouse.register_warehouse(&config.warehouse.path).await {
        error!("Failed to register warehouse tables: {}", e);
    }
    let analytical: Arc<dyn DatabaseAdapter> = Arc::new(warehouse);

    let (query_engine, pool) = match &config.database.url {
        Some(url) => {
            let (adapter, pool) = create_postgres_adapter(url, config.database.pool_size, pool_monitor.clone())
                .map_err(|e| {
                    error!("Failed to initialize database: {}", e);
                    e
                })?;
            (adapter as Arc<dyn DatabaseAdapter>, Some(pool))
        }
        None => {
            info!("DATABASE_URL not set, running queries on the analytical engine");
            (analytical.clone(), None)
        }
    };

    let execution = Arc::new(ExecutionService::new(
        ExecutionConfig::from(&config),
        query_engine,
        analytical,
        pool_monitor,
    ));

    let shutdown = CancellationToken::new();
    let reporter = MetricsReporter::spawn(
        Duration::from_secs(config.metrics.interval_secs),
        execution.clone(),
        shutdown.clone(),
    );

    // Create router with state
    let app = create_router(AppState {
        config: config.clone(),
        execution,
    });

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = reporter.await {
        error!("Metrics reporter ended abnormally: {}", e);
    }
    if let Some(pool) = pool {
        pool.close();
    }

    info!("Server stopped");
    Ok(())
}
