// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `validator.rs`

#[cfg(test)]
mod tests {
    use super::super::validate;
    use serde_json::json;

    fn web_service_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "required": ["image", "replicas"],
            "properties": {
                "image": {"type": "string", "minLength": 1},
                "replicas": {"type": "integer", "minimum": 1, "maximum": 10},
                "environment": {
                    "type": "string",
                    "enum": ["dev", "staging", "prod"],
                    "default": "dev"
                },
                "ports": {
                    "type": "array",
                    "items": {"type": "integer", "minimum": 1, "maximum": 65535}
                },
                "labels": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                }
            }
        })
    }

    #[test]
    fn test_valid_doc_passes_and_gets_defaults() {
        let doc = json!({"image": "nginx:1.25", "replicas": 3});

        let validated = validate(&web_service_schema(), &doc).unwrap();
        assert_eq!(validated["environment"], "dev");
        assert_eq!(validated["image"], "nginx:1.25");
    }

    #[test]
    fn test_explicit_value_is_not_overwritten_by_default() {
        let doc = json!({"image": "nginx", "replicas": 1, "environment": "prod"});

        let validated = validate(&web_service_schema(), &doc).unwrap();
        assert_eq!(validated["environment"], "prod");
    }

    #[test]
    fn test_missing_required_key_fails() {
        let doc = json!({"image": "nginx"});

        let errors = validate(&web_service_schema(), &doc).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "/replicas" && e.message.contains("required")));
    }

    #[test]
    fn test_type_mismatch_reports_both_types() {
        let doc = json!({"image": "nginx", "replicas": "three"});

        let errors = validate(&web_service_schema(), &doc).unwrap_err();
        let err = errors.iter().find(|e| e.path == "/replicas").unwrap();
        assert!(err.message.contains("expected integer"));
        assert!(err.message.contains("string"));
    }

    #[test]
    fn test_float_is_not_an_integer() {
        let doc = json!({"image": "nginx", "replicas": 2.5});

        let errors = validate(&web_service_schema(), &doc).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "/replicas"));
    }

    #[test]
    fn test_minimum_maximum_bounds() {
        let schema = web_service_schema();

        let low = validate(&schema, &json!({"image": "nginx", "replicas": 0}));
        assert!(low.unwrap_err().iter().any(|e| e.message.contains("minimum")));

        let high = validate(&schema, &json!({"image": "nginx", "replicas": 11}));
        assert!(high.unwrap_err().iter().any(|e| e.message.contains("maximum")));
    }

    #[test]
    fn test_enum_rejects_unknown_value() {
        let doc = json!({"image": "nginx", "replicas": 1, "environment": "qa"});

        let errors = validate(&web_service_schema(), &doc).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "/environment" && e.message.contains("enum")));
    }

    #[test]
    fn test_array_items_validated_with_index_paths() {
        let doc = json!({"image": "nginx", "replicas": 1, "ports": [80, 0, 443]});

        let errors = validate(&web_service_schema(), &doc).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "/ports/1"));
    }

    #[test]
    fn test_additional_properties_schema_applies_to_unknown_keys() {
        let doc = json!({
            "image": "nginx",
            "replicas": 1,
            "labels": {"team": "platform", "cost": 42}
        });

        let errors = validate(&web_service_schema(), &doc).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "/labels/cost"));
    }

    #[test]
    fn test_additional_properties_false_rejects_unknown_keys() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "additionalProperties": false
        });

        let errors = validate(&schema, &json!({"a": 1, "b": 2})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/b");
    }

    #[test]
    fn test_pattern_keyword() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string", "pattern": "^[a-z][a-z0-9-]*$"}}
        });

        assert!(validate(&schema, &json!({"name": "web-1"})).is_ok());
        let errors = validate(&schema, &json!({"name": "Web 1"})).unwrap_err();
        assert!(errors[0].message.contains("pattern"));
    }

    #[test]
    fn test_string_length_bounds() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string", "minLength": 2, "maxLength": 4}}
        });

        assert!(validate(&schema, &json!({"name": "ab"})).is_ok());
        assert!(validate(&schema, &json!({"name": "a"})).is_err());
        assert!(validate(&schema, &json!({"name": "abcde"})).is_err());
    }

    #[test]
    fn test_nested_defaults_apply_top_down() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tls": {
                    "type": "object",
                    "default": {},
                    "properties": {
                        "enabled": {"type": "boolean", "default": false}
                    }
                }
            }
        });

        let validated = validate(&schema, &json!({})).unwrap();
        assert_eq!(validated["tls"]["enabled"], false);
    }

    #[test]
    fn test_defaulted_value_satisfies_required() {
        let schema = json!({
            "type": "object",
            "required": ["mode"],
            "properties": {"mode": {"type": "string", "default": "auto"}}
        });

        let validated = validate(&schema, &json!({})).unwrap();
        assert_eq!(validated["mode"], "auto");
    }

    #[test]
    fn test_validation_is_deterministic() {
        let schema = web_service_schema();
        let doc = json!({"replicas": "x"});

        let a = validate(&schema, &doc).unwrap_err();
        let b = validate(&schema, &doc).unwrap_err();
        assert_eq!(a, b);
    }
}
