use crate::store::{Record, Store, StoreError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const RECEIVED_AT_FIELD: &str = "received_at";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("request body is not a JSON push envelope: {0}")]
    InvalidEnvelope(serde_json::Error),
    #[error("push envelope has no message")]
    MissingMessage,
    #[error("push message has no data")]
    MissingData,
    #[error("message data is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("message payload is not valid JSON: {0}")]
    InvalidPayload(serde_json::Error),
    #[error("message payload must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// True when the sender is at fault and retrying the same body cannot help.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, IngestError::Store(_))
    }
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(default)]
    message: Option<PushMessage>,
    #[serde(default)]
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default, rename = "messageId", alias = "message_id")]
    message_id: Option<String>,
}

#[derive(Debug)]
pub struct PushedMessage {
    pub record: Record,
    pub message_id: Option<String>,
    pub subscription: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// Unwraps `{message: {data: <base64>}}` into the JSON record it carries.
pub fn decode_push(body: &[u8]) -> Result<PushedMessage, IngestError> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(IngestError::InvalidEnvelope)?;
    let message = envelope.message.ok_or(IngestError::MissingMessage)?;
    let data = message
        .data
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(IngestError::MissingData)?;
    let bytes = STANDARD.decode(data)?;
    Ok(PushedMessage {
        record: decode_payload(&bytes)?,
        message_id: message.message_id,
        subscription: envelope.subscription,
        attributes: message.attributes,
    })
}

pub fn decode_payload(bytes: &[u8]) -> Result<Record, IngestError> {
    match serde_json::from_slice(bytes).map_err(IngestError::InvalidPayload)? {
        Value::Object(record) => Ok(record),
        _ => Err(IngestError::NotAnObject),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Push,
    Mqtt,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub stored: AtomicU64,
    pub rejected: AtomicU64,
    pub failed: AtomicU64,
    pub anomalies: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatsSnapshot {
    pub stored: u64,
    pub rejected: u64,
    pub failed: u64,
    pub anomalies: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            stored: self.stored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stamps incoming records with a receipt time and hands them to the store.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    collection: String,
    temperature_alert: f64,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, collection: impl Into<String>, temperature_alert: f64) -> Self {
        Self {
            store,
            collection: collection.into(),
            temperature_alert,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn ingest(&self, mut record: Record, source: Source) -> Result<String, IngestError> {
        record.insert(
            RECEIVED_AT_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        self.check_anomaly(&record);

        let device_id = record
            .get("device_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        match self.store.add(&self.collection, record).await {
            Ok(id) => {
                self.stats.stored.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = %id, device_id = %device_id, source = ?source, collection = %self.collection, "stored reading");
                Ok(id)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %err, device_id = %device_id, source = ?source, "failed to store reading");
                Err(err.into())
            }
        }
    }

    fn check_anomaly(&self, record: &Record) {
        let is_temperature = record.get("device_type").and_then(Value::as_str) == Some("temperature");
        let Some(value) = record.get("value").and_then(Value::as_f64) else {
            return;
        };
        if is_temperature && value > self.temperature_alert {
            self.stats.anomalies.fetch_add(1, Ordering::Relaxed);
            let device_id = record
                .get("device_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            tracing::warn!(
                device_id,
                value,
                threshold = self.temperature_alert,
                "high temperature reading"
            );
        }
    }
}
