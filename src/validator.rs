// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Spec validation against the OpenAPI v3 schema subset.
//!
//! [`validate`] is a pure function: no I/O, deterministic output. It applies
//! schema defaults top-down to missing keys first, then validates the
//! resulting document. Supported keywords:
//!
//! - `type`: `object`, `array`, `string`, `integer`, `number`, `boolean`
//! - `required`, `enum`, `minimum`/`maximum`, `minLength`/`maxLength`
//! - `pattern` (anchorless regex search, OpenAPI semantics)
//! - `items`, `properties`, `additionalProperties` (bool or schema)
//! - `default` (applied before validation on missing object keys)
//!
//! Unknown keywords are ignored, matching the permissive behavior of OpenAPI
//! tooling.

use serde_json::Value;

use crate::errors::ValidationError;

/// Validate `doc` against `schema`, returning the document with defaults
/// applied, or the full list of validation failures.
///
/// # Errors
///
/// Returns every violation found, each with a JSON-pointer-style `path`
/// relative to the document root.
pub fn validate(schema: &Value, doc: &Value) -> Result<Value, Vec<ValidationError>> {
    let mut doc = doc.clone();
    apply_defaults(schema, &mut doc);

    let mut errors = Vec::new();
    validate_value(schema, &doc, "", &mut errors);

    if errors.is_empty() {
        Ok(doc)
    } else {
        Err(errors)
    }
}

/// Insert schema defaults for missing object keys, recursively, top-down.
///
/// Defaults are applied before validation so a defaulted value is itself
/// validated and may satisfy `required`.
fn apply_defaults(schema: &Value, doc: &mut Value) {
    match (schema.get("properties"), doc) {
        (Some(Value::Object(properties)), Value::Object(fields)) => {
            for (key, prop_schema) in properties {
                if !fields.contains_key(key) {
                    if let Some(default) = prop_schema.get("default") {
                        fields.insert(key.clone(), default.clone());
                    }
                }
                if let Some(child) = fields.get_mut(key) {
                    apply_defaults(prop_schema, child);
                }
            }
        }
        (_, Value::Array(items)) => {
            if let Some(item_schema) = schema.get("items") {
                for item in items {
                    apply_defaults(item_schema, item);
                }
            }
        }
        _ => {}
    }
}

fn validate_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            push_error(
                errors,
                path,
                format!("expected {expected}, got {}", type_name(value)),
            );
            // Type mismatch makes the remaining keyword checks meaningless
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            push_error(errors, path, format!("value {value} is not in enum"));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
            if number < minimum {
                push_error(errors, path, format!("{number} is less than minimum {minimum}"));
            }
        }
        if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
            if number > maximum {
                push_error(
                    errors,
                    path,
                    format!("{number} is greater than maximum {maximum}"),
                );
            }
        }
    }

    if let Some(s) = value.as_str() {
        validate_string(schema, s, path, errors);
    }

    if let Value::Object(fields) = value {
        validate_object(schema, fields, path, errors);
    }

    if let Value::Array(items) = value {
        if let Some(item_schema) = schema.get("items") {
            for (index, item) in items.iter().enumerate() {
                validate_value(item_schema, item, &format!("{path}/{index}"), errors);
            }
        }
    }
}

fn validate_string(schema: &Value, s: &str, path: &str, errors: &mut Vec<ValidationError>) {
    let length = s.chars().count();

    if let Some(min_length) = schema.get("minLength").and_then(Value::as_u64) {
        if (length as u64) < min_length {
            push_error(
                errors,
                path,
                format!("length {length} is less than minLength {min_length}"),
            );
        }
    }
    if let Some(max_length) = schema.get("maxLength").and_then(Value::as_u64) {
        if (length as u64) > max_length {
            push_error(
                errors,
                path,
                format!("length {length} is greater than maxLength {max_length}"),
            );
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match regex::Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(s) {
                    push_error(errors, path, format!("does not match pattern {pattern:?}"));
                }
            }
            Err(_) => {
                push_error(errors, path, format!("schema pattern {pattern:?} is invalid"));
            }
        }
    }
}

fn validate_object(
    schema: &Value,
    fields: &serde_json::Map<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(key) {
                push_error(errors, &format!("{path}/{key}"), "is required".to_string());
            }
        }
    }

    let empty = serde_json::Map::new();
    let properties = match schema.get("properties") {
        Some(Value::Object(props)) => props,
        _ => &empty,
    };

    for (key, child) in fields {
        let child_path = format!("{path}/{key}");
        if let Some(prop_schema) = properties.get(key) {
            validate_value(prop_schema, child, &child_path, errors);
        } else {
            match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    push_error(errors, &child_path, "additional property is not allowed".to_string());
                }
                Some(additional @ Value::Object(_)) => {
                    validate_value(additional, child, &child_path, errors);
                }
                _ => {}
            }
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        // Accept 2.0 as an integer the way serde_json parses it: only true
        // integral representations count
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn push_error(errors: &mut Vec<ValidationError>, path: &str, message: String) {
    errors.push(ValidationError {
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        message,
    });
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod validator_tests;
