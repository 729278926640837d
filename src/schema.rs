//! JSON-schema generation for tool arguments and structured output.
//!
//! Schemas are generated with `schemars`, fully inlined, stripped of the
//! meta-schema and title, and tightened for strict function calling: every
//! object lists all of its properties as required and forbids additional
//! properties.

use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use serde_json::{Map, Value};

use crate::error::SchemaError;

/// Infers the strict JSON schema of `T`.
pub fn infer_json_schema<T>() -> Result<Value, SchemaError>
where
    T: JsonSchema + ?Sized,
{
    let settings = SchemaSettings::draft07().with(|settings| {
        settings.inline_subschemas = true;
        settings.meta_schema = None;
    });
    let root = settings.into_generator().into_root_schema_for::<T>();

    let mut schema = serde_json::to_value(root).map_err(|source| SchemaError::Serialize {
        type_name: std::any::type_name::<T>(),
        source,
    })?;

    let Some(object) = schema.as_object_mut() else {
        // `true` schemas describe "anything"; callers expect an object.
        return Ok(Value::Object(Map::new()));
    };
    object.remove("$schema");
    object.remove("title");

    make_strict(&mut schema);
    Ok(schema)
}

fn make_strict(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };

    if let Some(Value::Object(properties)) = object.get_mut("properties") {
        let required = properties
            .keys()
            .cloned()
            .map(Value::String)
            .collect::<Vec<_>>();
        for property in properties.values_mut() {
            make_strict(property);
        }
        object.insert("required".to_string(), Value::Array(required));
        object.insert("additionalProperties".to_string(), Value::Bool(false));
    }

    for key in ["items", "additionalItems"] {
        if let Some(child) = object.get_mut(key) {
            make_strict(child);
        }
    }

    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(variants)) = object.get_mut(key) {
            variants.iter_mut().for_each(make_strict);
        }
    }

    if let Some(Value::Object(definitions)) = object.get_mut("definitions") {
        definitions.values_mut().for_each(make_strict);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Pair {
        a: String,
        #[schemars(description = "hello")]
        b: String,
    }

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Outer {
        pair: Pair,
        note: Option<String>,
        tags: Vec<Pair>,
    }

    #[test]
    fn infers_flat_struct_schema() {
        let schema = infer_json_schema::<Pair>().expect("schema builds");

        assert_eq!(
            schema,
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "string"},
                    "b": {"type": "string", "description": "hello"}
                },
                "required": ["a", "b"],
                "additionalProperties": false
            })
        );
    }

    #[test]
    fn nested_objects_are_inlined_and_strict() {
        let schema = infer_json_schema::<Outer>().expect("schema builds");

        assert!(schema.get("definitions").is_none());
        let mut required = schema["required"]
            .as_array()
            .expect("required is an array")
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>();
        required.sort_unstable();
        assert_eq!(required, ["note", "pair", "tags"]);
        assert_eq!(schema["properties"]["pair"]["additionalProperties"], false);
        assert_eq!(
            schema["properties"]["tags"]["items"]["additionalProperties"],
            false
        );
        assert_eq!(schema["properties"]["note"]["type"], json!(["string", "null"]));
    }

    #[test]
    fn scalar_schemas_pass_through() {
        let schema = infer_json_schema::<String>().expect("schema builds");
        assert_eq!(schema, json!({"type": "string"}));
    }
}
