use anyhow::{Context, Result};
use reading_processor::config::Config;
use reading_processor::db::{connect_lazy, PgStore};
use reading_processor::ingest::Ingestor;
use reading_processor::store::{MemoryStore, Store};
use reading_processor::{mqtt, routes, state};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn build_store(config: &Config) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::new(connect_lazy(url, config.db_pool_size)?);
            store.ensure_schema().await?;
            tracing::info!("storing readings in Postgres");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                retention = config.memory_retention,
                "no database configured; newest readings are kept in memory only"
            );
            Ok(Arc::new(MemoryStore::with_retention(config.memory_retention)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reading_processor=info".into()),
        )
        .with_target(true)
        .init();

    let config = Config::from_env()?;
    let store = build_store(&config).await?;
    let ingestor = Ingestor::new(store, config.collection.clone(), config.temperature_alert);
    let state = state::AppState::new(ingestor.clone(), config.history_limit);

    let cancel = CancellationToken::new();
    let mqtt_handle = if config.enable_mqtt_listener {
        let listener_config = config.clone();
        let connected = state.mqtt_connected.clone();
        let listener_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(listener_config, ingestor, connected, listener_cancel).await
        }))
    } else {
        None
    };

    let app = routes::router(state);
    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind processor HTTP listener on {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, collection = %config.collection, "reading-processor HTTP listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Some(handle) = mqtt_handle {
        let _ = handle.await;
    }
    Ok(())
}
