use std::fmt;
use std::str::FromStr;

use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// We use `Box<str>` for strings that don't need to grow after construction.
// This keeps allocations compact and avoids accidental cloning of large
// values.
type BoxStr = Box<str>;

/// Identifier of a telemetry source (a weather station).
///
/// The shape is validated at construction so that no malformed identifier
/// ever reaches the wire: either `X-Y-NNN` (two uppercase letters and a
/// three-digit serial, e.g. `M-X-001`) or the compact `M-` form with one or
/// two uppercase alphanumerics (e.g. `M-01`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(BoxStr);

/// Error returned when a device identifier does not match the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device id: {0:?}")]
pub struct InvalidDeviceId(pub BoxStr);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_shape(s: &str) -> bool {
        let b = s.as_bytes();

        // Station form: `X-Y-NNN`.
        let station = b.len() == 7
            && b[0].is_ascii_uppercase()
            && b[1] == b'-'
            && b[2].is_ascii_uppercase()
            && b[3] == b'-'
            && b[4..].iter().all(|c| c.is_ascii_digit());

        // Compact form: `M-X` or `M-01`.
        let compact = (b.len() == 3 || b.len() == 4)
            && b[0] == b'M'
            && b[1] == b'-'
            && b[2..]
                .iter()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());

        station || compact
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if DeviceId::is_valid_shape(s) {
            Ok(DeviceId(s.into()))
        } else {
            Err(InvalidDeviceId(s.into()))
        }
    }
}

impl TryFrom<String> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0.into()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single timestamped set of sensor measurements for one device.
///
/// The record is sparse: an absent field means "not measured", never a
/// false zero. Values deserialize through [`NotNan`] so NaN is rejected at
/// the boundary; fields outside this closed set are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: DeviceId,
    pub timestamp: jiff::Timestamp,
    /// Air temperature in degrees Celsius.
    #[serde(default)]
    pub temperature: Option<NotNan<f64>>,
    /// Relative humidity as a percentage.
    #[serde(default)]
    pub humidity: Option<NotNan<f64>>,
    /// Barometric pressure in hPa.
    #[serde(default)]
    pub pressure: Option<NotNan<f64>>,
    /// Wind speed in m/s.
    #[serde(default)]
    pub wind_speed: Option<NotNan<f64>>,
    /// Wind direction in degrees (0 = north, clockwise).
    #[serde(default)]
    pub wind_direction: Option<NotNan<f64>>,
    /// Rainfall over the last hour in millimeters.
    #[serde(default)]
    pub rainfall: Option<NotNan<f64>>,
    /// Illuminance in lux.
    #[serde(default)]
    pub illuminance: Option<NotNan<f64>>,
    /// Visibility in meters.
    #[serde(default)]
    pub visibility: Option<NotNan<f64>>,
    /// Derived apparent ("feels like") temperature in degrees Celsius.
    #[serde(default)]
    pub feels_like: Option<NotNan<f64>>,
}

impl Reading {
    /// A reading with no measurements, useful as a starting point when
    /// building records by hand.
    pub fn empty(device_id: DeviceId, timestamp: jiff::Timestamp) -> Self {
        Self {
            device_id,
            timestamp,
            temperature: None,
            humidity: None,
            pressure: None,
            wind_speed: None,
            wind_direction: None,
            rainfall: None,
            illuminance: None,
            visibility: None,
            feels_like: None,
        }
    }

    /// Plausibility check against physical sensor ranges.
    ///
    /// Out-of-range temperature or humidity marks the reading [`Bad`];
    /// implausible pressure or wind speed only degrades it to [`Suspect`].
    ///
    /// [`Bad`]: ReadingQuality::Bad
    /// [`Suspect`]: ReadingQuality::Suspect
    pub fn quality(&self) -> ReadingQuality {
        if let Some(t) = self.temperature
            && !(-40.0..=60.0).contains(&t.into_inner())
        {
            return ReadingQuality::Bad;
        }
        if let Some(h) = self.humidity
            && !(0.0..=100.0).contains(&h.into_inner())
        {
            return ReadingQuality::Bad;
        }
        if let Some(p) = self.pressure
            && !(900.0..=1100.0).contains(&p.into_inner())
        {
            return ReadingQuality::Suspect;
        }
        if let Some(w) = self.wind_speed
            && !(0.0..=100.0).contains(&w.into_inner())
        {
            return ReadingQuality::Suspect;
        }
        ReadingQuality::Good
    }
}

/// Outcome of the plausibility check on a [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingQuality {
    Good,
    Suspect,
    Bad,
}

/// Aggregation period for statistics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatsPeriod {
    Hour,
    Day,
}

impl fmt::Display for StatsPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsPeriod::Hour => f.write_str("HOUR"),
            StatsPeriod::Day => f.write_str("DAY"),
        }
    }
}

/// Max/min/avg aggregate for one measurement over a period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub max: NotNan<f64>,
    pub min: NotNan<f64>,
    pub avg: NotNan<f64>,
}

impl MetricStats {
    /// Holds when the upstream aggregate is well formed: `min <= avg <= max`.
    pub fn is_consistent(&self) -> bool {
        self.min <= self.avg && self.avg <= self.max
    }
}

/// Per-metric aggregates for one device over a `[start_time, end_time)`
/// period.
///
/// An upstream summary with `samples == 0` carries zero-division sentinels
/// in its value fields and must be treated as absent; use [`is_empty`] before
/// trusting any of the aggregates.
///
/// [`is_empty`]: StatSummary::is_empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSummary {
    pub device_id: DeviceId,
    pub period: StatsPeriod,
    pub start_time: jiff::Timestamp,
    pub end_time: jiff::Timestamp,
    #[serde(default)]
    pub temperature: Option<MetricStats>,
    #[serde(default)]
    pub humidity: Option<MetricStats>,
    #[serde(default)]
    pub pressure: Option<MetricStats>,
    #[serde(default)]
    pub wind_speed: Option<MetricStats>,
    #[serde(default)]
    pub wind_direction: Option<MetricStats>,
    #[serde(default)]
    pub rainfall: Option<MetricStats>,
    #[serde(default)]
    pub illuminance: Option<MetricStats>,
    #[serde(default)]
    pub visibility: Option<MetricStats>,
    #[serde(default)]
    pub feels_like: Option<MetricStats>,
    /// Number of raw readings behind the aggregates.
    pub samples: u32,
}

impl StatSummary {
    /// True when no raw readings back this summary, in which case the
    /// aggregate fields must not be trusted even if structurally present.
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// State of one persistent push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// 16-point compass label for a wind direction in degrees.
pub fn wind_direction_label(degrees: f64) -> &'static str {
    const DIRECTIONS: [&str; 16] = [
        "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW",
        "NW", "NNW",
    ];
    let index = (degrees / 22.5).round() as usize % 16;
    DIRECTIONS[index]
}

/// Apparent temperature estimate for readings where the upstream omits the
/// derived value.
///
/// Uses the standard wind-chill formula below 10 °C with appreciable wind
/// and a humidity-based heat index above 27 °C; otherwise the air
/// temperature is returned unchanged.
pub fn feels_like(temperature: f64, wind_speed: f64, humidity: f64) -> f64 {
    if temperature <= 10.0 && wind_speed > 1.3 {
        13.12 + 0.6215 * temperature - 11.37 * wind_speed.powf(0.16)
            + 0.3965 * temperature * wind_speed.powf(0.16)
    } else if temperature >= 27.0 {
        temperature + 0.5 * (humidity - 50.0)
    } else {
        temperature
    }
}
