//! Strict-but-forgiving argument coercion for tool inputs.
//!
//! Assistants routinely send numbers as strings and booleans as numbers;
//! each accessor coerces the obvious cases and rejects the rest with an
//! actionable message.

use anyhow::{Result, bail};
use serde_json::Value;

pub fn required_string(args: &Value, field: &str) -> Result<String> {
    match optional_string(args, field)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("missing required argument '{field}'"),
    }
}

pub fn optional_string(args: &Value, field: &str) -> Result<Option<String>> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(Value::Bool(value)) => Ok(Some(value.to_string())),
        Some(other) => bail!("argument '{field}' must be a string, got {}", kind_of(other)),
    }
}

pub fn optional_i64(args: &Value, field: &str) -> Result<Option<i64>> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(value)) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|float| float as i64))
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("argument '{field}' is out of integer range")),
        Some(Value::String(raw)) => match raw.trim().parse::<i64>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => bail!("argument '{field}' must be an integer, got '{raw}'"),
        },
        Some(other) => bail!("argument '{field}' must be an integer, got {}", kind_of(other)),
    }
}

pub fn optional_f64(args: &Value, field: &str) -> Result<Option<f64>> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(value)) => Ok(value.as_f64()),
        Some(Value::String(raw)) => match raw.trim().parse::<f64>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => bail!("argument '{field}' must be a number, got '{raw}'"),
        },
        Some(other) => bail!("argument '{field}' must be a number, got {}", kind_of(other)),
    }
}

pub fn optional_bool(args: &Value, field: &str) -> Result<Option<bool>> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(Value::String(raw)) => match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => bail!("argument '{field}' must be a boolean, got '{raw}'"),
        },
        Some(Value::Number(value)) => Ok(Some(value.as_f64().unwrap_or(0.0) != 0.0)),
        Some(other) => bail!("argument '{field}' must be a boolean, got {}", kind_of(other)),
    }
}

pub fn optional_string_array(args: &Value, field: &str) -> Result<Vec<String>> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(value) => values.push(value.clone()),
                    other => bail!(
                        "argument '{field}' must be an array of strings, found {}",
                        kind_of(other)
                    ),
                }
            }
            Ok(values)
        }
        // A lone string is accepted as a one-element list.
        Some(Value::String(value)) => Ok(vec![value.clone()]),
        Some(other) => bail!(
            "argument '{field}' must be an array of strings, got {}",
            kind_of(other)
        ),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_string_accepts_and_rejects() {
        let args = json!({"content": "code", "blank": "  "});
        assert_eq!(required_string(&args, "content").unwrap(), "code");
        assert!(required_string(&args, "blank").is_err());
        assert!(required_string(&args, "missing").is_err());
    }

    #[test]
    fn strings_coerce_from_scalars() {
        let args = json!({"n": 5, "b": true});
        assert_eq!(optional_string(&args, "n").unwrap().unwrap(), "5");
        assert_eq!(optional_string(&args, "b").unwrap().unwrap(), "true");
        assert!(optional_string(&json!({"o": {}}), "o").is_err());
    }

    #[test]
    fn integers_coerce_from_strings_and_floats() {
        let args = json!({"a": 7, "b": "12", "c": 3.9, "d": "x"});
        assert_eq!(optional_i64(&args, "a").unwrap(), Some(7));
        assert_eq!(optional_i64(&args, "b").unwrap(), Some(12));
        assert_eq!(optional_i64(&args, "c").unwrap(), Some(3));
        assert!(optional_i64(&args, "d").is_err());
        assert_eq!(optional_i64(&args, "missing").unwrap(), None);
    }

    #[test]
    fn floats_coerce_from_strings() {
        let args = json!({"a": 0.7, "b": "0.25"});
        assert_eq!(optional_f64(&args, "a").unwrap(), Some(0.7));
        assert_eq!(optional_f64(&args, "b").unwrap(), Some(0.25));
    }

    #[test]
    fn bools_coerce_from_strings_and_numbers() {
        let args = json!({"a": true, "b": "yes", "c": 0, "d": "maybe"});
        assert_eq!(optional_bool(&args, "a").unwrap(), Some(true));
        assert_eq!(optional_bool(&args, "b").unwrap(), Some(true));
        assert_eq!(optional_bool(&args, "c").unwrap(), Some(false));
        assert!(optional_bool(&args, "d").is_err());
    }

    #[test]
    fn string_arrays_accept_single_string() {
        let args = json!({"a": ["x", "y"], "b": "solo", "c": [1]});
        assert_eq!(optional_string_array(&args, "a").unwrap(), vec!["x", "y"]);
        assert_eq!(optional_string_array(&args, "b").unwrap(), vec!["solo"]);
        assert!(optional_string_array(&args, "c").is_err());
        assert!(optional_string_array(&args, "missing").unwrap().is_empty());
    }
}
