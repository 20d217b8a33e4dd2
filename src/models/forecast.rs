use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Numeric forecast attributes carried through to the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    FeelsLike,
    TempMin,
    TempMax,
    Humidity,
    Pressure,
    WindSpeed,
    WindDirection,
    Visibility,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::Temperature,
        Metric::FeelsLike,
        Metric::TempMin,
        Metric::TempMax,
        Metric::Humidity,
        Metric::Pressure,
        Metric::WindSpeed,
        Metric::WindDirection,
        Metric::Visibility,
    ];

    /// Warehouse column name.
    pub fn column(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::FeelsLike => "feels_like",
            Metric::TempMin => "temp_min",
            Metric::TempMax => "temp_max",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::WindSpeed => "wind_speed",
            Metric::WindDirection => "wind_direction",
            Metric::Visibility => "visibility",
        }
    }

    pub fn units(self) -> &'static str {
        match self {
            Metric::Temperature | Metric::FeelsLike | Metric::TempMin | Metric::TempMax => "°C",
            Metric::Humidity => "%",
            Metric::Pressure => "hPa",
            Metric::WindSpeed => "m/s",
            Metric::WindDirection => "°",
            Metric::Visibility => "m",
        }
    }

    pub fn is_temperature(self) -> bool {
        matches!(
            self,
            Metric::Temperature | Metric::FeelsLike | Metric::TempMin | Metric::TempMax
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for Metric {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Metric::ALL
            .into_iter()
            .find(|m| m.column() == wanted)
            .ok_or_else(|| PipelineError::UnknownMetric(s.to_string()))
    }
}

/// One provider forecast point as landed in the raw partition.
///
/// `payload` is untrusted provider JSON; only the transform engine interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Arrival order within the extraction run.
    pub seq: u64,
    pub fetched_at: DateTime<Utc>,
    /// Location the provider was queried for.
    pub source_location: String,
    pub payload: serde_json::Value,
}

/// A typed forecast observation for one (location, forecast time) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub location_id: String,
    pub forecast_time: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub feels_like: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub visibility: Option<f64>,
    pub weather_category: Option<String>,
    pub source_timestamp: Option<String>,
}

impl ForecastRecord {
    pub fn new(location_id: impl Into<String>, forecast_time: DateTime<Utc>) -> Self {
        Self {
            location_id: location_id.into(),
            forecast_time,
            temperature: None,
            feels_like: None,
            temp_min: None,
            temp_max: None,
            humidity: None,
            pressure: None,
            wind_speed: None,
            wind_direction: None,
            visibility: None,
            weather_category: None,
            source_timestamp: None,
        }
    }

    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::FeelsLike => self.feels_like,
            Metric::TempMin => self.temp_min,
            Metric::TempMax => self.temp_max,
            Metric::Humidity => self.humidity,
            Metric::Pressure => self.pressure,
            Metric::WindSpeed => self.wind_speed,
            Metric::WindDirection => self.wind_direction,
            Metric::Visibility => self.visibility,
        }
    }

    pub fn set_metric(&mut self, metric: Metric, value: Option<f64>) {
        let slot = match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::FeelsLike => &mut self.feels_like,
            Metric::TempMin => &mut self.temp_min,
            Metric::TempMax => &mut self.temp_max,
            Metric::Humidity => &mut self.humidity,
            Metric::Pressure => &mut self.pressure,
            Metric::WindSpeed => &mut self.wind_speed,
            Metric::WindDirection => &mut self.wind_direction,
            Metric::Visibility => &mut self.visibility,
        };
        *slot = value;
    }

    pub fn with_metric(mut self, metric: Metric, value: f64) -> Self {
        self.set_metric(metric, Some(value));
        self
    }

    /// True when every present numeric value is finite.
    pub fn has_finite_numerics(&self) -> bool {
        Metric::ALL
            .iter()
            .filter_map(|m| self.metric(*m))
            .all(f64::is_finite)
    }
}
