//! Normalization of final-output payloads.
//!
//! Evaluated code finishes a request either by calling `SUBMIT(..)` or by
//! leaving `FINAL_ANSWER` set. Both paths end up here so the host always sees
//! a JSON object.

use serde_json::{Map, Value};

/// Key used for unnamed final values.
pub const OUTPUT_KEY: &str = "output";
/// Key used when the payload could not be normalized.
pub const ERROR_KEY: &str = "error";

/// Normalize positional values submitted by evaluated code.
///
/// - no `output_names`, one value: `{"output": v}`
/// - no `output_names`, several values: `{"output": [v1, v2, ..]}`
/// - with `output_names`: `{name_i: v_i}`
///
/// A count mismatch yields `{"error": ".."}` instead of failing.
pub fn normalize_final(values: Vec<Value>, output_names: &[String]) -> Value {
    if output_names.is_empty() {
        return match values.len() {
            0 => error_payload("SUBMIT() requires at least one value".to_string()),
            1 => keyed(OUTPUT_KEY, values.into_iter().next().unwrap_or(Value::Null)),
            _ => keyed(OUTPUT_KEY, Value::Array(values)),
        };
    }

    if values.len() != output_names.len() {
        return error_payload(format!(
            "SUBMIT() expected {} value(s) ({}) but received {}",
            output_names.len(),
            output_names.join(", "),
            values.len()
        ));
    }

    let object: Map<String, Value> = output_names.iter().cloned().zip(values).collect();
    Value::Object(object)
}

/// Normalize a value left in the implicit completion variable.
///
/// A single declared output name labels the value directly. With several names
/// the value must be an object that carries every one of them; extra keys are
/// dropped. Without names the value is treated as one positional value.
pub fn normalize_implicit(value: Value, output_names: &[String]) -> Value {
    match output_names.len() {
        0 | 1 => normalize_final(vec![value], output_names),
        _ => match value {
            Value::Object(mut object) => {
                let missing: Vec<&str> = output_names
                    .iter()
                    .filter(|name| !object.contains_key(name.as_str()))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return error_payload(format!(
                        "FINAL_ANSWER is missing output(s): {}",
                        missing.join(", ")
                    ));
                }
                let named: Map<String, Value> = output_names
                    .iter()
                    .map(|name| (name.clone(), object.remove(name).unwrap_or(Value::Null)))
                    .collect();
                Value::Object(named)
            }
            other => error_payload(format!(
                "FINAL_ANSWER must be a map with keys {} when several outputs are declared (got {})",
                output_names.join(", "),
                type_name(&other)
            )),
        },
    }
}

fn error_payload(message: String) -> Value {
    keyed(ERROR_KEY, Value::String(message))
}

fn keyed(key: &str, value: Value) -> Value {
    let mut object = Map::new();
    object.insert(key.to_string(), value);
    Value::Object(object)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
