use serde_json::{Map, Value};

// The upstream protobuf validator accepts a narrow JSON-Schema dialect: it
// rejects unknown keywords, `$`-prefixed metadata, and union types. This
// strips a tool input spec down to the accepted subset. Equal inputs produce
// identical output (serde_json maps iterate in key order).

const STRIP_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "default",
    "examples",
    "title",
    "deprecated",
    "readOnly",
    "writeOnly",
    "additionalProperties",
    "const",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "unevaluatedProperties",
    "patternProperties",
];

const NESTED_SCHEMA_LISTS: &[&str] = &["anyOf", "oneOf", "allOf"];

pub fn sanitize_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in STRIP_KEYS {
                map.remove(*key);
            }
            coerce_nullable_union(map);
            for (key, child) in map.iter_mut() {
                match key.as_str() {
                    "properties" => {
                        if let Value::Object(props) = child {
                            for (_, schema) in props.iter_mut() {
                                sanitize_schema(schema);
                            }
                        }
                    }
                    "items" => sanitize_schema(child),
                    key if NESTED_SCHEMA_LISTS.contains(&key) => {
                        if let Value::Array(schemas) = child {
                            for schema in schemas.iter_mut() {
                                sanitize_schema(schema);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                sanitize_schema(child);
            }
        }
        _ => {}
    }
}

// `type: ["string", "null"]` becomes `type: "string", nullable: true`; the
// validator rejects the array shape outright.
fn coerce_nullable_union(map: &mut Map<String, Value>) {
    let Some(Value::Array(types)) = map.get("type") else {
        return;
    };
    let mut nullable = false;
    let mut concrete: Option<String> = None;
    for entry in types {
        match entry.as_str() {
            Some("null") => nullable = true,
            Some(other) => {
                if concrete.is_none() {
                    concrete = Some(other.to_string());
                }
            }
            None => {}
        }
    }
    match concrete {
        Some(ty) => {
            map.insert("type".to_string(), Value::String(ty));
            if nullable {
                map.insert("nullable".to_string(), Value::Bool(true));
            }
        }
        None => {
            map.remove("type");
        }
    }
}

// Tool names the upstream accepts: [A-Za-z0-9_-], at most 64 chars.
pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "tool".to_string()
    } else {
        cleaned
    }
}
