use crate::config::Config;
use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const ATTR_DEVICE_TYPE: &str = "device_type";
pub const ATTR_DEVICE_ID: &str = "device_id";

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("mqtt client rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("publish failed: {0}")]
    Other(String),
}

/// Outbound side of the pipeline: hands an encoded reading to the transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: &Attributes,
    ) -> Result<String, PublishError>;
}

#[derive(Debug, Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(config: &Config) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        // Sized so every device can have a few readings in flight.
        let capacity = config.devices.len().saturating_mul(4).max(16);
        let (client, mut eventloop) = AsyncClient::new(options, capacity);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt event loop error; reconnecting");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        (Self { client }, handle)
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: &Attributes,
    ) -> Result<String, PublishError> {
        let topic = routed_topic(topic, attributes);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(Uuid::new_v4().to_string())
    }
}

/// MQTT 3.1.1 carries no per-message attributes, so routing metadata is
/// folded into the topic as `<base>/<device_type>/<device_id>`.
pub fn routed_topic(base: &str, attributes: &Attributes) -> String {
    let mut topic = base.trim_end_matches('/').to_string();
    for key in [ATTR_DEVICE_TYPE, ATTR_DEVICE_ID] {
        if let Some(value) = attributes.get(key) {
            topic.push('/');
            topic.push_str(&topic_segment(value));
        }
    }
    topic
}

fn topic_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_attributes_extend_the_topic() {
        let mut attrs = Attributes::new();
        attrs.insert(ATTR_DEVICE_TYPE.to_string(), "temperature".to_string());
        attrs.insert(ATTR_DEVICE_ID.to_string(), "t-1".to_string());
        assert_eq!(routed_topic("iot/readings/", &attrs), "iot/readings/temperature/t-1");
    }

    #[test]
    fn wildcards_in_segments_are_neutralized() {
        let mut attrs = Attributes::new();
        attrs.insert(ATTR_DEVICE_ID.to_string(), "a/b+#".to_string());
        assert_eq!(routed_topic("iot", &attrs), "iot/a_b__");
        assert_eq!(routed_topic("iot", &Attributes::new()), "iot");
    }
}
