use crate::generator::{SensorKind, ValueRange};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_TOPIC: &str = "iot/readings";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("no devices configured")]
    NoDevices,
    #[error("device #{index} has an empty id")]
    EmptyDeviceId { index: usize },
    #[error("device id {0:?} is configured more than once")]
    DuplicateDeviceId(String),
    #[error("device {device}: interval {interval_ms} ms is outside {min_ms}-{max_ms} ms")]
    IntervalOutOfBand {
        device: String,
        interval_ms: u64,
        min_ms: u64,
        max_ms: u64,
    },
    #[error("device {device}: invalid value range {min}..{max}")]
    InvalidRange { device: String, min: f64, max: f64 },
    #[error("device {device}: range {min}..{max} is too wide to sample")]
    RangeTooWide { device: String, min: f64, max: f64 },
    #[error("device {device}: range {min}..{max} holds no integer for {kind}")]
    EmptyDiscreteRange {
        device: String,
        kind: SensorKind,
        min: f64,
        max: f64,
    },
    #[error("interval band {min_ms}-{max_ms} ms is empty")]
    InvalidBand { min_ms: u64, max_ms: u64 },
    #[error("unknown cadence {0:?} (expected fixed, deadline or jitter)")]
    InvalidCadence(String),
}

/// How an emission loop waits between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CadenceMode {
    /// Sleep whatever is left of the interval after the tick; slow ticks drift.
    #[default]
    Fixed,
    /// Sleep until the next absolute fire time so drift does not accumulate.
    Deadline,
    /// Sleep a fresh random delay from the interval band on every tick.
    Jitter,
}

impl FromStr for CadenceMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(CadenceMode::Fixed),
            "deadline" => Ok(CadenceMode::Deadline),
            "jitter" => Ok(CadenceMode::Jitter),
            _ => Err(ConfigError::InvalidCadence(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBand {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for IntervalBand {
    fn default() -> Self {
        Self {
            min_ms: 20,
            max_ms: 100,
        }
    }
}

impl IntervalBand {
    pub fn contains(&self, interval_ms: u64) -> bool {
        (self.min_ms..=self.max_ms).contains(&interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: SensorKind,
    pub location: String,
    pub interval_ms: u64,
    /// `None` only for kinds without a default range that were configured
    /// without one; such devices never produce a value.
    pub range: Option<ValueRange>,
}

impl DeviceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    #[serde(default, alias = "pubsub_topic_id")]
    topic: Option<String>,
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    id: String,
    #[serde(alias = "type")]
    kind: SensorKind,
    #[serde(default)]
    location: String,
    #[serde(alias = "frequency_ms")]
    interval_ms: u64,
    #[serde(default)]
    range: Option<ValueRange>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub topic: String,

    pub http_bind: String,

    pub publish_timeout: Duration,
    pub cadence: CadenceMode,
    pub interval_band: IntervalBand,
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = PathBuf::from(env_string(
            "EMULATOR_CONFIG_PATH",
            Some("config.json".to_string()),
        )?);

        let mqtt_url = env_string(
            "EMULATOR_MQTT_URL",
            Some("mqtt://127.0.0.1:1883".to_string()),
        )?;
        let url = Url::parse(&mqtt_url).context("invalid EMULATOR_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("EMULATOR_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("EMULATOR_MQTT_USERNAME");
        let mqtt_password = env_optional("EMULATOR_MQTT_PASSWORD");
        let mqtt_client_id = env_string(
            "EMULATOR_MQTT_CLIENT_ID",
            Some(format!("device-emulator-{}", std::process::id())),
        )?;

        let http_bind = match env_optional("EMULATOR_HTTP_BIND") {
            Some(bind) => bind,
            None => format!("0.0.0.0:{}", env_u64("PORT", Some(8080))?),
        };

        let publish_timeout =
            Duration::from_millis(env_u64("EMULATOR_PUBLISH_TIMEOUT_MS", Some(1000))?);
        let cadence = env_string("EMULATOR_CADENCE", Some("fixed".to_string()))?
            .parse::<CadenceMode>()?;
        let interval_band = IntervalBand {
            min_ms: env_u64("EMULATOR_MIN_INTERVAL_MS", Some(20))?,
            max_ms: env_u64("EMULATOR_MAX_INTERVAL_MS", Some(100))?,
        };

        let file = load_device_file(&config_path)?;
        let devices = resolve_devices(file.devices, interval_band)?;
        let topic = env_optional("EMULATOR_TOPIC")
            .or(file.topic)
            .map(|t| t.trim().trim_end_matches('/').to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            topic,
            http_bind,
            publish_timeout,
            cadence,
            interval_band,
            devices,
        })
    }
}

fn load_device_file(path: &Path) -> Result<DeviceFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read device config at {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse device config at {}", path.display()))
}

fn resolve_devices(
    entries: Vec<DeviceEntry>,
    band: IntervalBand,
) -> Result<Vec<DeviceConfig>, ConfigError> {
    if band.min_ms == 0 || band.min_ms > band.max_ms {
        return Err(ConfigError::InvalidBand {
            min_ms: band.min_ms,
            max_ms: band.max_ms,
        });
    }
    if entries.is_empty() {
        return Err(ConfigError::NoDevices);
    }

    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let id = entry.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::EmptyDeviceId { index });
        }
        if !seen.insert(id.clone()) {
            return Err(ConfigError::DuplicateDeviceId(id));
        }
        if !band.contains(entry.interval_ms) {
            return Err(ConfigError::IntervalOutOfBand {
                device: id,
                interval_ms: entry.interval_ms,
                min_ms: band.min_ms,
                max_ms: band.max_ms,
            });
        }

        let range = entry.range.or_else(|| entry.kind.default_range());
        if let Some(range) = range {
            if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                return Err(ConfigError::InvalidRange {
                    device: id,
                    min: range.min,
                    max: range.max,
                });
            }
            if !range.has_finite_span() || (entry.kind.is_discrete() && !range.fits_i64()) {
                return Err(ConfigError::RangeTooWide {
                    device: id,
                    min: range.min,
                    max: range.max,
                });
            }
            if entry.kind.is_discrete() && range.integer_bounds().is_none() {
                return Err(ConfigError::EmptyDiscreteRange {
                    device: id,
                    kind: entry.kind,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        if let SensorKind::Unknown(name) = &entry.kind {
            tracing::warn!(device_id = %id, kind = %name, "unsupported sensor kind; device will not emit");
        }

        devices.push(DeviceConfig {
            id,
            kind: entry.kind,
            location: entry.location.trim().to_string(),
            interval_ms: entry.interval_ms,
            range,
        });
    }
    Ok(devices)
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
