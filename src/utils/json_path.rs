use serde_json::Value;

/// Look up a dotted path such as `main.temp` or `weather.0.main`.
///
/// Numeric segments index into arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

/// Dotted paths of every scalar leaf in `value`.
pub fn leaf_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_leaves(value, String::new(), &mut paths);
    paths
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

fn collect_leaves(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                collect_leaves(child, join(&prefix, key), out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                collect_leaves(child, join(&prefix, &i.to_string()), out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push(prefix);
            }
        }
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_walks_objects_and_arrays() {
        let v = json!({"main": {"temp": 12.5}, "weather": [{"main": "Rain"}]});
        assert_eq!(get_path(&v, "main.temp"), Some(&json!(12.5)));
        assert_eq!(get_path(&v, "weather.0.main"), Some(&json!("Rain")));
        assert_eq!(get_path(&v, "weather.1.main"), None);
        assert_eq!(get_path(&v, "main.temp.deep"), None);
    }

    #[test]
    fn test_get_path_mut_replaces_value() {
        let mut v = json!({"main": {"temp": 290.0}});
        if let Some(slot) = get_path_mut(&mut v, "main.temp") {
            *slot = json!(16.85);
        }
        assert_eq!(v, json!({"main": {"temp": 16.85}}));
    }

    #[test]
    fn test_leaf_paths_flattens_nested_payload() {
        let v = json!({"dt": 1, "main": {"temp": 1, "humidity": 2}, "weather": [{"id": 500}], "rain": {}});
        let mut paths = leaf_paths(&v);
        paths.sort();
        assert_eq!(
            paths,
            vec!["dt", "main.humidity", "main.temp", "rain", "weather.0.id"]
        );
    }
}
