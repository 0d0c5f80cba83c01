use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensor category. Kinds the emulator cannot sample are kept by name so the
/// device still loads and its loop can skip ticks instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Light,
    Unknown(String),
}

impl SensorKind {
    pub fn as_str(&self) -> &str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Light => "light",
            SensorKind::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            SensorKind::Temperature => Some("°C"),
            SensorKind::Humidity => Some("%"),
            SensorKind::Light => Some("Lux"),
            SensorKind::Unknown(_) => None,
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, SensorKind::Humidity | SensorKind::Light)
    }

    pub fn default_range(&self) -> Option<ValueRange> {
        match self {
            SensorKind::Temperature => Some(ValueRange::new(15.0, 30.0)),
            SensorKind::Humidity => Some(ValueRange::new(30.0, 80.0)),
            SensorKind::Light => Some(ValueRange::new(100.0, 1000.0)),
            SensorKind::Unknown(_) => None,
        }
    }
}

impl From<String> for SensorKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "temperature" => SensorKind::Temperature,
            "humidity" => SensorKind::Humidity,
            "light" => SensorKind::Light,
            _ => SensorKind::Unknown(raw.trim().to_string()),
        }
    }
}

impl From<SensorKind> for String {
    fn from(kind: SensorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const I64_MIN_F: f64 = i64::MIN as f64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// False when `max - min` overflows, or is close enough to `f64::MAX`
    /// that the uniform sampler's scale would.
    pub fn has_finite_span(&self) -> bool {
        let span = self.max - self.min;
        span.is_finite() && span.abs() <= f64::MAX / 2.0
    }

    /// True when both bounds are representable as `i64`.
    pub fn fits_i64(&self) -> bool {
        // i64::MAX as f64 rounds up to 2^63, which is out of range.
        self.min >= I64_MIN_F && self.max < -I64_MIN_F
    }

    /// Inclusive integer bounds inside the range, if there are any.
    pub fn integer_bounds(&self) -> Option<(i64, i64)> {
        let lo = self.min.ceil();
        let hi = self.max.floor();
        if !lo.is_finite() || !hi.is_finite() || lo > hi || !self.fits_i64() {
            return None;
        }
        Some((lo as i64, hi as i64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleValue {
    Continuous(f64),
    Discrete(i64),
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Continuous(v) => write!(f, "{v:.2}"),
            SampleValue::Discrete(v) => write!(f, "{v}"),
        }
    }
}

/// Draws one sample for `kind` within `range`. Returns `None` for kinds the
/// emulator does not know how to sample, or for an empty range.
pub fn generate_value<R: Rng>(
    kind: &SensorKind,
    range: &ValueRange,
    rng: &mut R,
) -> Option<SampleValue> {
    match kind {
        SensorKind::Unknown(_) => None,
        kind if kind.is_discrete() => {
            let (lo, hi) = range.integer_bounds()?;
            Some(SampleValue::Discrete(rng.gen_range(lo..=hi)))
        }
        _ => {
            if !range.has_finite_span() || range.min > range.max {
                return None;
            }
            let raw = if range.min == range.max {
                range.min
            } else {
                rng.gen_range(range.min..=range.max)
            };
            let rounded = (raw * 100.0).round() / 100.0;
            Some(SampleValue::Continuous(rounded.clamp(range.min, range.max)))
        }
    }
}
