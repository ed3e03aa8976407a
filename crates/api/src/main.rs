//! API server entry point.

use std::error::Error;
use std::sync::Arc;

use api::config::{Config, LogFormat};
use checkout::{InMemorySessionStore, PostgresSessionStore, SessionStore};
use events::{SharedPublisher, TracingPublisher};
use inventory::{InMemoryStockStore, PostgresStockStore, StockStore};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
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
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);
    config.validate()?;

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick the storage backend
    let publisher: SharedPublisher = Arc::new(TracingPublisher);
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let stock = PostgresStockStore::new(pool.clone());
            stock.run_migrations().await?;
            tracing::info!("migrations applied");
            let sessions = Arc::new(PostgresSessionStore::new(pool));
            serve(config, stock, sessions, publisher, metrics_handle, "postgres").await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            let sessions = Arc::new(InMemorySessionStore::new());
            serve(
                config,
                InMemoryStockStore::new(),
                sessions,
                publisher,
                metrics_handle,
                "memory",
            )
            .await
        }
    }
}

async fn serve<S: StockStore + 'static>(
    config: Config,
    stock: S,
    sessions: Arc<dyn SessionStore>,
    publisher: SharedPublisher,
    metrics_handle: PrometheusHandle,
    storage: &'static str,
) -> Result<(), Box<dyn Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. Wire the engine, coordinator and reaper
    let (state, reaper) = api::create_state(
        &config,
        stock,
        sessions,
        publisher,
        Some(shutdown_rx.clone()),
        storage,
    );
    let reaper_task = tokio::spawn(reaper.run(shutdown_rx));

    // 5. Build the application
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, storage, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // In-flight sagas abandon their current step and compensate.
            let _ = signal_tx.send(true);
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper_task.await {
        tracing::error!(error = %e, "reaper task panicked");
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
