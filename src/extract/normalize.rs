use chrono::SecondsFormat;
use serde_json::Value;

use crate::config::TemperatureUnits;
use crate::error::ExtractError;
use crate::transform::coercion::{coerce_numeric, Coerced};
use crate::utils::constants::KELVIN_OFFSET;
use crate::utils::json_path::{get_path, get_path_mut, json_type_name};
use crate::utils::parse_timestamp;

const TEMPERATURE_PATHS: [&str; 9] = [
    "main.temp",
    "main.feels_like",
    "main.temp_min",
    "main.temp_max",
    "temp",
    "feels_like",
    "temp_min",
    "temp_max",
    "temperature",
];

const TIME_PATHS: [&str; 3] = ["dt", "dt_txt", "timestamp"];

/// Normalize the envelope of one provider point.
///
/// Adds a UTC RFC 3339 `timestamp`, keeps the provider's own time text in
/// `source_timestamp` and converts Kelvin temperatures to Celsius. Field values
/// are otherwise left as delivered; typing happens in the transform engine.
pub fn normalize_point(
    point: Value,
    units: TemperatureUnits,
    location: &str,
) -> Result<Value, ExtractError> {
    let mut point = match point {
        Value::Object(_) => point,
        other => {
            return Err(ExtractError::MalformedPayload {
                location: location.to_string(),
                reason: format!("forecast point is {}, not an object", json_type_name(&other)),
            })
        }
    };

    let found = TIME_PATHS.iter().find_map(|path| {
        get_path(&point, path).and_then(|raw| parse_timestamp(raw).map(|t| (raw.clone(), t)))
    });

    if let Some((raw, instant)) = found {
        if let Value::Object(fields) = &mut point {
            if !fields.contains_key("source_timestamp") {
                let source = match raw {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                fields.insert("source_timestamp".to_string(), Value::String(source));
            }
            fields.insert(
                "timestamp".to_string(),
                Value::String(instant.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
    }

    if units == TemperatureUnits::Kelvin {
        for path in TEMPERATURE_PATHS {
            // Anything the transform would read as a number is converted here,
            // numeric strings included; violations stay for the transform to count.
            if let Some(slot) = get_path_mut(&mut point, path) {
                if let Coerced::Value(kelvin) = coerce_numeric(Some(&*slot)) {
                    if let Some(celsius) = serde_json::Number::from_f64(kelvin - KELVIN_OFFSET) {
                        *slot = Value::Number(celsius);
                    }
                }
            }
        }
    }

    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unix_seconds_become_rfc3339() {
        let point = normalize_point(json!({"dt": 1717200000}), TemperatureUnits::Celsius, "1").unwrap();
        assert_eq!(point["timestamp"], json!("2024-06-01T00:00:00Z"));
        assert_eq!(point["source_timestamp"], json!("1717200000"));
    }

    #[test]
    fn test_naive_text_is_taken_as_utc() {
        let point = normalize_point(
            json!({"dt_txt": "2024-06-01 03:00:00"}),
            TemperatureUnits::Celsius,
            "1",
        )
        .unwrap();
        assert_eq!(point["timestamp"], json!("2024-06-01T03:00:00Z"));
        assert_eq!(point["source_timestamp"], json!("2024-06-01 03:00:00"));
    }

    #[test]
    fn test_offset_timestamp_is_converted_to_utc() {
        let point = normalize_point(
            json!({"timestamp": "2024-06-01T05:00:00+02:00"}),
            TemperatureUnits::Celsius,
            "1",
        )
        .unwrap();
        assert_eq!(point["timestamp"], json!("2024-06-01T03:00:00Z"));
    }

    #[test]
    fn test_kelvin_conversion_only_touches_temperatures() {
        let point = normalize_point(
            json!({"dt": 0, "main": {"temp": 300.15, "feels_like": "warm", "temp_min": "", "humidity": 40}}),
            TemperatureUnits::Kelvin,
            "1",
        )
        .unwrap();
        let temp = point["main"]["temp"].as_f64().unwrap();
        assert!((temp - 27.0).abs() < 1e-9);
        assert_eq!(point["main"]["feels_like"], json!("warm"));
        assert_eq!(point["main"]["temp_min"], json!(""));
        assert_eq!(point["main"]["humidity"], json!(40));
    }

    #[test]
    fn test_kelvin_numeric_strings_are_converted_like_numbers() {
        let number = normalize_point(json!({"main": {"temp": 300.15}}), TemperatureUnits::Kelvin, "1")
            .unwrap();
        let text = normalize_point(
            json!({"main": {"temp": " 300.15 "}}),
            TemperatureUnits::Kelvin,
            "1",
        )
        .unwrap();

        let a = coerce_numeric(number.pointer("/main/temp"));
        let b = coerce_numeric(text.pointer("/main/temp"));
        match (a, b) {
            (Coerced::Value(a), Coerced::Value(b)) => {
                assert!((a - 27.0).abs() < 1e-9);
                assert!((b - 27.0).abs() < 1e-9);
            }
            other => panic!("expected two values, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_time_is_left_for_the_transform() {
        let point = normalize_point(json!({"main": {"temp": 1}}), TemperatureUnits::Celsius, "1").unwrap();
        assert!(point.get("timestamp").is_none());
    }

    #[test]
    fn test_non_object_point_is_malformed() {
        let err = normalize_point(json!([1, 2]), TemperatureUnits::Celsius, "1").unwrap_err();
        assert!(matches!(err, ExtractError::MalformedPayload { .. }));
    }
}
