//! Provider field aliases.
//!
//! This is the single place that knows how provider payloads are shaped. Each
//! target attribute lists the dotted paths it may arrive under; the first path
//! holding a non-null value wins. Any other leaf is reported as unknown and
//! otherwise ignored, so new provider fields never fail a batch.

use serde_json::Value;

use crate::models::Metric;
use crate::utils::json_path::get_path;

pub const LOCATION_PATHS: &[&str] = &["location_id", "location.id", "city.id"];
pub const TIME_PATHS: &[&str] = &["timestamp", "dt_txt", "dt"];
pub const CATEGORY_PATHS: &[&str] = &["weather.0.main", "weather_category", "weather"];
pub const SOURCE_TIME_PATHS: &[&str] = &["source_timestamp"];

pub fn metric_paths(metric: Metric) -> &'static [&'static str] {
    match metric {
        Metric::Temperature => &["main.temp", "temp", "temperature"],
        Metric::FeelsLike => &["main.feels_like", "feels_like"],
        Metric::TempMin => &["main.temp_min", "temp_min"],
        Metric::TempMax => &["main.temp_max", "temp_max"],
        Metric::Humidity => &["main.humidity", "humidity"],
        Metric::Pressure => &["main.pressure", "pressure"],
        Metric::WindSpeed => &["wind.speed", "wind_speed"],
        Metric::WindDirection => &["wind.deg", "wind_direction"],
        Metric::Visibility => &["visibility"],
    }
}

/// First non-null value among `paths`.
pub fn first_present<'a>(payload: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| get_path(payload, path))
        .find(|value| !value.is_null())
}

/// Whether a leaf path is consumed by the mapping.
pub fn is_known_path(path: &str) -> bool {
    let mapped = LOCATION_PATHS
        .iter()
        .chain(TIME_PATHS)
        .chain(CATEGORY_PATHS)
        .chain(SOURCE_TIME_PATHS)
        .chain(Metric::ALL.iter().flat_map(|m| metric_paths(*m)))
        .any(|known| *known == path);
    // `weather` may also arrive as a list of plain labels
    mapped || path.strip_prefix("weather.").is_some_and(|rest| rest.parse::<usize>().is_ok())
}
