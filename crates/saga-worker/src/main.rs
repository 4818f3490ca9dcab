//! Saga worker entry point.

use metrics_exporter_prometheus::PrometheusBuilder;
use saga::OrchestratorConfig;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaPersistence};
use saga_worker::services::{
    InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService,
};
use saga_worker::{Config, FulfillmentServices, LogFormat, Worker, WorkerError};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<P: SagaPersistence + 'static>(
    store: P,
    services: &FulfillmentServices,
    config: &Config,
) -> Result<(), WorkerError> {
    let registry = saga_worker::registry(services)?;
    let worker = Worker::new(store, registry, OrchestratorConfig::from_env()).await;

    worker.start_demo_orders(config.demo_orders).await?;
    worker.run(config.recovery_interval, shutdown_signal()).await?;

    tracing::info!("worker shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install the Prometheus exporter with its own scrape listener
    let metrics_addr = config
        .metrics_socket_addr()
        .map_err(|e| WorkerError::Config(format!("METRICS_ADDR: {e}")))?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| WorkerError::Metrics(e.to_string()))?;
    tracing::info!(%metrics_addr, "metrics exporter listening");

    // 3. Wire the fulfillment services
    let services = FulfillmentServices::in_memory(
        InMemoryInventoryService::new(),
        InMemoryPaymentService::new(),
        InMemoryShippingService::new(),
    );

    // 4. Pick the store and run until a shutdown signal
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresSagaStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL saga store");
            serve(store, &services, &config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, sagas are kept in memory only");
            serve(InMemorySagaStore::new(), &services, &config).await
        }
    }
}
