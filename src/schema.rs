//! Input-schema derivation.
//!
//! Tool and prompt argument types derive [`schemars::JsonSchema`] alongside
//! `serde::Deserialize`; at registration time the schema is generated and
//! normalized down to the subset the protocol uses: every property carries a
//! `type` drawn from `{string, integer, number, boolean, array, object}`,
//! nullable unions are collapsed to their inner type, numeric bounds and
//! format hints are stripped, and doc comments on fields carry through as
//! property descriptions. Fields that are not `Option` end up in `required`.

use schemars::JsonSchema;
use serde_json::{Map, Value};

use crate::types::PromptArgument;

/// Generates the normalized input schema for an argument type.
///
/// # Returns
///
/// A JSON Schema object describing `T`'s fields
pub fn generate_schema<T: JsonSchema>() -> Value {
    let root = schemars::schema_for!(T);
    let mut schema =
        serde_json::to_value(root.schema).unwrap_or_else(|_| Value::Object(Map::new()));
    normalize_schema(&mut schema);
    schema
}

fn normalize_schema(schema: &mut Value) {
    let Value::Object(map) = schema else {
        return;
    };

    map.remove("title");
    map.entry("type")
        .or_insert_with(|| Value::String("object".to_string()));
    let properties = map
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));

    if let Value::Object(properties) = properties {
        for property in properties.values_mut() {
            normalize_property(property);
        }
    }
}

fn normalize_property(property: &mut Value) {
    let Value::Object(prop) = property else {
        return;
    };

    // Collapse schemars' nullable unions ([T, "null"]) to the inner type.
    if let Some(Value::Array(types)) = prop.get("type") {
        let main_type = types
            .iter()
            .find(|t| *t != &Value::String("null".to_string()))
            .cloned()
            .unwrap_or_else(|| Value::String("string".to_string()));
        prop.insert("type".to_string(), main_type);
    }

    prop.remove("format");
    prop.remove("minimum");
    prop.remove("maximum");
}

/// Derive prompt argument metadata from a normalized input schema.
///
/// Each schema property becomes one argument; `required` reflects membership
/// in the schema's `required` array.
pub(crate) fn arguments_from_schema(schema: &Value) -> Vec<PromptArgument> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, prop)| PromptArgument {
                    name: name.clone(),
                    description: prop
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    required: Some(required.contains(&name.as_str())),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        /// The message to echo back
        message: String,
        count: Option<u32>,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct MixedArgs {
        name: String,
        age: u32,
        score: f64,
        active: bool,
        tags: Vec<String>,
        nickname: Option<String>,
    }

    #[derive(Deserialize, JsonSchema)]
    struct NoArgs {}

    #[test]
    fn string_field_with_description() {
        let schema = generate_schema::<EchoArgs>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["message"]["type"], "string");
        assert_eq!(
            schema["properties"]["message"]["description"],
            "The message to echo back"
        );
    }

    #[test]
    fn non_nullable_fields_are_required() {
        let schema = generate_schema::<EchoArgs>();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&serde_json::json!("message")));
        assert!(!required.contains(&serde_json::json!("count")));
    }

    #[test]
    fn optional_integer_collapses_to_plain_integer() {
        let schema = generate_schema::<EchoArgs>();
        let count = &schema["properties"]["count"];
        assert_eq!(count["type"], "integer");
        assert!(count.get("format").is_none());
        assert!(count.get("minimum").is_none());
    }

    #[test]
    fn primitive_type_mapping() {
        let schema = generate_schema::<MixedArgs>();
        let props = &schema["properties"];
        assert_eq!(props["name"]["type"], "string");
        assert_eq!(props["age"]["type"], "integer");
        assert_eq!(props["score"]["type"], "number");
        assert_eq!(props["active"]["type"], "boolean");
        assert_eq!(props["tags"]["type"], "array");
        assert_eq!(props["nickname"]["type"], "string");
    }

    #[test]
    fn no_title_or_format_noise() {
        let schema = generate_schema::<MixedArgs>();
        assert!(schema.get("title").is_none());
        assert!(schema["properties"]["score"].get("format").is_none());
        assert!(schema["properties"]["age"].get("format").is_none());
    }

    #[test]
    fn empty_struct_yields_empty_object_schema() {
        let schema = generate_schema::<NoArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].as_object().unwrap().is_empty());
    }

    #[test]
    fn prompt_arguments_from_schema() {
        let schema = generate_schema::<EchoArgs>();
        let args = arguments_from_schema(&schema);
        assert_eq!(args.len(), 2);

        let message = args.iter().find(|a| a.name == "message").unwrap();
        assert_eq!(message.required, Some(true));
        assert_eq!(
            message.description.as_deref(),
            Some("The message to echo back")
        );

        let count = args.iter().find(|a| a.name == "count").unwrap();
        assert_eq!(count.required, Some(false));
    }
}
