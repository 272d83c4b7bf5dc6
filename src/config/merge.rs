//! Layer merging
//!
//! Objects deep-merge by key, arrays and scalars are replaced by the later
//! layer. A `null` in a later layer clears the value.

use serde_json::Value;

/// Merge `overlay` on top of `base`
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let next = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in precedence order (last wins)
pub fn merge_layers(layers: impl IntoIterator<Item = Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Convert a parsed TOML document to JSON for merging
pub fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_tables_merge_by_key() {
        let merged = deep_merge(
            json!({"build": {"local": false, "push": true}}),
            json!({"build": {"local": true}}),
        );
        assert_eq!(merged, json!({"build": {"local": true, "push": true}}));
    }

    #[test]
    fn test_arrays_replace() {
        let merged = deep_merge(json!({"paths": ["a", "b"]}), json!({"paths": ["c"]}));
        assert_eq!(merged["paths"], json!(["c"]));
    }

    #[test]
    fn test_later_layers_win() {
        let merged = merge_layers(vec![
            json!({"api_host": "a", "build": {"push": true}}),
            json!({"api_host": "b"}),
            json!({"api_host": "c", "build": {"push": null}}),
        ]);
        assert_eq!(merged["api_host"], "c");
        assert!(merged["build"]["push"].is_null());
    }

    #[test]
    fn test_toml_conversion() {
        let doc: toml::Value = toml::from_str("api_host = \"x\"\n[watch]\npoll_interval_ms = 250\n").unwrap();
        let value = toml_to_json(doc);
        assert_eq!(value["api_host"], "x");
        assert_eq!(value["watch"]["poll_interval_ms"], 250);
    }
}
