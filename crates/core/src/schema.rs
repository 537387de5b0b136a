//! Argument-schema checks for tool registration and dispatch.
//!
//! Only the subset of JSON Schema that tool definitions actually use is
//! understood: an object with `properties`, `required` and primitive `type`s.

use serde_json::Value;

/// Check that a tool's parameter schema is well-formed.
pub fn validate_schema(schema: &Value) -> Result<(), String> {
    let obj = schema
        .as_object()
        .ok_or_else(|| "schema must be a JSON object".to_string())?;

    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {}
        Some(other) => return Err(format!("schema type must be \"object\", got \"{other}\"")),
        None => return Err("schema is missing \"type\": \"object\"".into()),
    }

    let properties = match obj.get("properties") {
        None => None,
        Some(Value::Object(p)) => Some(p),
        Some(_) => return Err("\"properties\" must be an object".into()),
    };

    if let Some(props) = properties {
        for (name, prop) in props {
            if let Some(t) = prop.get("type") {
                let known = t.as_str().map(is_known_type).unwrap_or(false);
                if !known {
                    return Err(format!("property '{name}' has unsupported type {t}"));
                }
            }
        }
    }

    if let Some(required) = obj.get("required") {
        let list = required
            .as_array()
            .ok_or_else(|| "\"required\" must be an array".to_string())?;
        for key in list {
            let key = key
                .as_str()
                .ok_or_else(|| "\"required\" entries must be strings".to_string())?;
            if !properties.is_some_and(|p| p.contains_key(key)) {
                return Err(format!("required key '{key}' is not declared in properties"));
            }
        }
    }

    Ok(())
}

/// Check call arguments against a schema that already passed [`validate_schema`].
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let args = args
        .as_object()
        .ok_or_else(|| "arguments must be a JSON object".to_string())?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                return Err(format!("missing required argument '{key}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args {
            let Some(expected) = props
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !matches_type(expected, value) {
                return Err(format!(
                    "argument '{key}' should be of type {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn is_known_type(t: &str) -> bool {
    matches!(
        t,
        "string" | "number" | "integer" | "boolean" | "object" | "array" | "null"
    )
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
