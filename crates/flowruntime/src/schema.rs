//! Instance input validation and output projection against the definition's
//! JSON-schema-like documents. Only `required` and `properties.<f>.type` are
//! interpreted.

use serde_json::{Map, Value};

/// Check `input` against `schema`, collecting every violation.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), Vec<String>> {
    let Some(fields) = input.as_object() else {
        return Err(vec!["Input must be a JSON object".to_string()]);
    };

    let mut errors = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(field) {
                errors.push(format!("Missing required field: {}", field));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, field_schema) in properties {
            let (Some(value), Some(expected)) = (
                fields.get(field),
                field_schema.get("type").and_then(Value::as_str),
            ) else {
                continue;
            };
            if !matches_type(value, expected) {
                errors.push(format!("Field {} must be {}", field, article(expected)));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().map_or(false, |f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are not enforced.
        _ => true,
    }
}

fn article(type_name: &str) -> String {
    match type_name.chars().next() {
        Some('a' | 'e' | 'i' | 'o' | 'u') => format!("an {}", type_name),
        _ => format!("a {}", type_name),
    }
}

/// Instance output once every step is terminal.
///
/// With declared `properties`, the final variables are projected onto those
/// names (absent variables are omitted). Without them, the output of the last
/// completed step is used.
pub fn project_output(
    schema: &Value,
    variables: &Map<String, Value>,
    last_output: Option<&Value>,
) -> Value {
    match schema.get("properties").and_then(Value::as_object) {
        Some(properties) if !properties.is_empty() => Value::Object(
            properties
                .keys()
                .filter_map(|name| variables.get(name).map(|v| (name.clone(), v.clone())))
                .collect(),
        ),
        _ => last_output
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    }
}
