//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::config::{Config, LogFormat};
use outbox_store::{InMemoryStore, PostgresStore, TransactionalStore};
use relay::{InMemoryBroker, MessageBroker, RelayConfig, WebhookBroker};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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

async fn open_store(config: &Config) -> Arc<dyn TransactionalStore> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url, config.database_max_connections)
                .await
                .expect("failed to connect to database");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using postgres outbox store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory outbox store");
            Arc::new(InMemoryStore::new())
        }
    }
}

fn open_broker(config: &Config) -> Arc<dyn MessageBroker> {
    match &config.webhook_url {
        Some(url) => {
            let broker = WebhookBroker::new(url.as_str(), config.webhook_timeout)
                .expect("failed to build webhook broker");
            tracing::info!(%url, "publishing to webhook broker");
            Arc::new(broker)
        }
        None => {
            tracing::warn!("WEBHOOK_URL not set, publishing to in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open the store and broker, then start the relay
    let store = open_store(&config).await;
    let broker = open_broker(&config);
    let state = api::create_state(store.clone(), broker, RelayConfig::from_env());
    state.relay.start().await.expect("failed to start relay");

    // 4. Schedule retention cleanup of published rows and abandoned transactions
    let background = CancellationToken::new();
    let retention = tokio::spawn(api::run_retention(
        store,
        config.retention,
        config.transaction_max_age,
        RETENTION_INTERVAL,
        background.child_token(),
    ));

    // 5. Build the application
    let app = api::create_app(state.clone(), metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Drain the relay before exiting
    background.cancel();
    let _ = retention.await;
    if let Err(e) = state.relay.stop().await {
        tracing::warn!(error = %e, "relay did not stop cleanly");
    }

    tracing::info!("server shut down gracefully");
}
