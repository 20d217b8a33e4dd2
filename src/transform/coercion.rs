use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::utils::parse_timestamp;

/// Result of forcing a provider value to a number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coerced {
    Value(f64),
    /// Missing, null or blank. Not a quality violation.
    Absent,
    /// Present but not representable as a finite number.
    Violation,
}

pub fn coerce_numeric(value: Option<&Value>) -> Coerced {
    let finite = |n: f64| {
        if n.is_finite() {
            Coerced::Value(n)
        } else {
            Coerced::Violation
        }
    };

    match value {
        None | Some(Value::Null) => Coerced::Absent,
        Some(Value::Number(n)) => n.as_f64().map_or(Coerced::Violation, finite),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                Coerced::Absent
            } else {
                s.parse::<f64>().map_or(Coerced::Violation, finite)
            }
        }
        Some(_) => Coerced::Violation,
    }
}

/// Location ids may be strings or integers; integers are rendered as text.
pub fn coerce_location(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| format!("{f:.0}"))
            }
        }
        _ => None,
    }
}

pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    parse_timestamp(value)
}

/// Short text labels. Numbers are accepted and rendered; structures are not.
pub fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
