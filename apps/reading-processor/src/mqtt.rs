use crate::config::Config;
use crate::ingest::{decode_payload, Ingestor, Source};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Subscribes to the emulator topic tree and stores every reading it sees.
/// Reconnects on any connection error until `cancel` fires.
pub async fn run_listener(
    config: Config,
    ingestor: Ingestor,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let filter = config.mqtt_filter();
    while !cancel.is_cancelled() {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "failed to subscribe to MQTT; retrying");
            if !backoff(Duration::from_secs(2), &cancel).await {
                break;
            }
            continue;
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    connected.store(false, Ordering::Relaxed);
                    return;
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::SubAck(_))) => {
                    tracing::info!(topic = %filter, "subscribed to readings feed");
                    connected.store(true, Ordering::Relaxed);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let record = match decode_payload(&publish.payload) {
                        Ok(record) => record,
                        Err(err) => {
                            ingestor.stats().record_rejected();
                            tracing::warn!(error = %err, topic = %publish.topic, "failed to decode MQTT payload");
                            continue;
                        }
                    };
                    if let Err(err) = ingestor.ingest(record, Source::Mqtt).await {
                        tracing::warn!(error = %err, topic = %publish.topic, "failed to ingest MQTT reading");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        if !backoff(Duration::from_secs(1), &cancel).await {
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
}

/// Waits out a reconnect delay. Returns false if `cancel` fired first.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
