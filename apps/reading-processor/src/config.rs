use crate::store::DEFAULT_RETENTION;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug)]
pub struct Config {
    pub http_bind: String,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub collection: String,
    pub history_limit: usize,
    pub memory_retention: usize,
    pub temperature_alert: f64,
    pub enable_mqtt_listener: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let http_bind = match env_optional("PROCESSOR_HTTP_BIND") {
            Some(bind) => bind,
            None => {
                let port = env::var("PORT")
                    .ok()
                    .map(|v| v.trim().parse::<u16>())
                    .transpose()
                    .context("invalid PORT")?
                    .unwrap_or(8081);
                format!("0.0.0.0:{port}")
            }
        };

        let database_url = env_optional("PROCESSOR_DATABASE_URL")
            .or_else(|| env_optional("DATABASE_URL"));
        let db_pool_size = env::var("PROCESSOR_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);

        let collection =
            env_optional("PROCESSOR_COLLECTION").unwrap_or_else(|| "iot_readings".to_string());
        let history_limit = env::var("PROCESSOR_HISTORY_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(20);
        let memory_retention = resolve_retention(
            env_optional("PROCESSOR_MEMORY_RETENTION").as_deref(),
            history_limit,
        );
        let temperature_alert = env::var("PROCESSOR_TEMPERATURE_ALERT")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(28.0);

        let enable_mqtt_listener = env::var("PROCESSOR_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mqtt_url = env_optional("PROCESSOR_MQTT_URL")
            .unwrap_or_else(|| "mqtt://127.0.0.1:1883".to_string());
        let url = Url::parse(&mqtt_url).context("invalid PROCESSOR_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("PROCESSOR_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("PROCESSOR_MQTT_USERNAME");
        let mqtt_password = env_optional("PROCESSOR_MQTT_PASSWORD");
        let mqtt_topic = env_optional("PROCESSOR_MQTT_TOPIC")
            .map(|t| t.trim_end_matches('/').to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "iot/readings".to_string());
        let mqtt_keepalive_secs = env::var("PROCESSOR_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let mqtt_client_id = env_optional("PROCESSOR_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("reading-processor-{}", std::process::id()));

        Ok(Self {
            http_bind,
            database_url,
            db_pool_size,
            collection,
            history_limit,
            memory_retention,
            temperature_alert,
            enable_mqtt_listener,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic,
            mqtt_keepalive_secs,
            mqtt_client_id,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    /// Subscription filter covering the base topic and every routed subtopic.
    pub fn mqtt_filter(&self) -> String {
        format!("{}/#", self.mqtt_topic)
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// The in-memory store must hold at least one full history page.
fn resolve_retention(raw: Option<&str>, history_limit: usize) -> usize {
    raw.and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_RETENTION)
        .max(history_limit)
}
