mod config;
mod emitter;
mod generator;
mod http;
mod publisher;
mod reading;
mod run_state;

use crate::config::Config;
use crate::emitter::{spawn_emitters, EmitterContext};
use crate::publisher::MqttPublisher;
use crate::run_state::RunState;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,device_emulator=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    // Invalid device configuration ends the process before any emitter starts.
    let config = Config::from_env()?;

    let (publisher, mqtt_task) = MqttPublisher::new(&config);
    tracing::info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        topic = %config.topic,
        "publishing readings over MQTT"
    );

    let run_state = Arc::new(RunState::default());
    let ctx = EmitterContext {
        run_state: run_state.clone(),
        publisher: Arc::new(publisher),
        topic: config.topic.clone(),
        publish_timeout: config.publish_timeout,
        cadence: config.cadence,
        band: config.interval_band,
    };

    let cancel = CancellationToken::new();
    let (devices, emitter_tasks) = spawn_emitters(&config.devices, &ctx, &cancel);
    tracing::info!(devices = devices.len(), "all emitters started");

    let app = http::router(http::HttpState {
        run_state,
        devices: Arc::new(devices),
        topic: config.topic.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind emulator HTTP listener on {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "device-emulator HTTP listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "HTTP server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    cancel.cancel();
    for task in emitter_tasks {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "emitter task failed");
        }
    }
    mqtt_task.abort();
    tracing::info!("emitters stopped");

    Ok(())
}
