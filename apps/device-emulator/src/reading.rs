use crate::config::DeviceConfig;
use crate::generator::{SampleValue, SensorKind};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

/// One synthetic sample. Fields are private so the unit always follows the
/// kind and the emission time cannot be rewritten after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(rename = "device_id")]
    source_id: String,
    #[serde(rename = "device_type")]
    kind: SensorKind,
    value: SampleValue,
    unit: Option<&'static str>,
    location: String,
    #[serde(rename = "timestamp", serialize_with = "serialize_utc")]
    emitted_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(device: &DeviceConfig, value: SampleValue, emitted_at: DateTime<Utc>) -> Self {
        Self {
            source_id: device.id.clone(),
            kind: device.kind.clone(),
            value,
            unit: device.kind.unit(),
            location: device.location.clone(),
            emitted_at,
        }
    }

    pub fn value(&self) -> SampleValue {
        self.value
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn serialize_utc<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}
