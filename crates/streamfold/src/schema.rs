//! Declarative descriptions of the structured values a decode session expects.
//!
//! A [`Schema`] is built once per request type and shared immutably by every
//! session that decodes against it. Validation comes in two strengths:
//! [`Schema::validate_partial`] only checks the types of whatever is already
//! populated, [`Schema::validate_complete`] additionally requires every
//! required field and exact enum membership.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::errors::SchemaError;

/// Shape of an expected JSON value.
#[derive(Clone, Debug, PartialEq)]
pub enum Schema {
    /// Accepts any value.
    Any,
    Null,
    Boolean,
    /// A number without a fractional part or exponent.
    Integer,
    Number,
    /// A string, optionally restricted to a fixed set of values.
    String { variants: Option<Vec<String>> },
    /// A homogeneous array.
    Array(Box<Schema>),
    Object(ObjectSchema),
    /// `null` or the inner schema.
    Nullable(Box<Schema>),
}

/// Named fields of an object schema.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ObjectSchema {
    pub fields: Vec<Field>,
    /// Whether keys not listed in `fields` are accepted.
    pub additional_fields: bool,
}

impl ObjectSchema {
    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One named member of an object schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
    /// Human-readable text passed through to JSON Schema `description`.
    pub description: Option<String>,
}

impl Field {
    /// A field that must be present in the final value.
    pub fn required(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            required: true,
            description: None,
        }
    }

    /// A field that may be absent from the final value.
    pub fn optional(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            required: false,
            description: None,
        }
    }

    /// Attaches a description.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// A value that does not conform to a schema.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct Violation {
    pub path: String,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Partial,
    Complete,
}

impl Schema {
    pub fn string() -> Self {
        Schema::String { variants: None }
    }

    /// A string restricted to the given values.
    pub fn enumeration<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Schema::String {
            variants: Some(variants.into_iter().map(Into::into).collect()),
        }
    }

    pub fn number() -> Self {
        Schema::Number
    }

    pub fn integer() -> Self {
        Schema::Integer
    }

    pub fn boolean() -> Self {
        Schema::Boolean
    }

    pub fn null() -> Self {
        Schema::Null
    }

    pub fn any() -> Self {
        Schema::Any
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array(Box::new(items))
    }

    /// A closed object with the given fields.
    pub fn object(fields: impl IntoIterator<Item = Field>) -> Self {
        Schema::Object(ObjectSchema {
            fields: fields.into_iter().collect(),
            additional_fields: false,
        })
    }

    /// Wraps the schema so `null` is also accepted.
    pub fn nullable(self) -> Self {
        match self {
            Schema::Nullable(_) | Schema::Null | Schema::Any => self,
            other => Schema::Nullable(Box::new(other)),
        }
    }

    /// Allows unknown keys on an object schema. No-op for other kinds.
    pub fn allow_additional_fields(self) -> Self {
        match self {
            Schema::Object(mut object) => {
                object.additional_fields = true;
                Schema::Object(object)
            }
            other => other,
        }
    }

    /// Checks the schema itself (duplicate field names, empty enums).
    pub fn check(&self) -> Result<(), SchemaError> {
        self.check_at("$")
    }

    fn check_at(&self, path: &str) -> Result<(), SchemaError> {
        match self {
            Schema::String {
                variants: Some(variants),
            } if variants.is_empty() => Err(SchemaError::new(path, "enum has no variants")),
            Schema::Array(items) => items.check_at(&format!("{path}[]")),
            Schema::Nullable(inner) => inner.check_at(path),
            Schema::Object(object) => {
                let mut seen = HashSet::new();
                for field in &object.fields {
                    if field.name.is_empty() {
                        return Err(SchemaError::new(path, "field name must not be empty"));
                    }
                    if !seen.insert(field.name.as_str()) {
                        return Err(SchemaError::new(
                            path,
                            format!("duplicate field `{}`", field.name),
                        ));
                    }
                    field.schema.check_at(&child_path(path, &field.name))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Checks the types of every populated part of `value`.
    pub fn validate_partial(&self, value: &Value) -> Result<(), Violation> {
        self.validate_at(value, "$", Mode::Partial)
    }

    /// Checks `value` as a finished result: types, required fields and enums.
    pub fn validate_complete(&self, value: &Value) -> Result<(), Violation> {
        self.validate_at(value, "$", Mode::Complete)
    }

    fn validate_at(&self, value: &Value, path: &str, mode: Mode) -> Result<(), Violation> {
        match (self, value) {
            (Schema::Any, _) => Ok(()),
            (Schema::Nullable(_), Value::Null) => Ok(()),
            (Schema::Nullable(inner), _) => inner.validate_at(value, path, mode),
            (Schema::Null, Value::Null) | (Schema::Boolean, Value::Bool(_)) => Ok(()),
            (Schema::Number, Value::Number(_)) => Ok(()),
            (Schema::Integer, Value::Number(n)) if is_integral(n) => Ok(()),
            (Schema::Integer, Value::Number(n)) => {
                Err(violation(path, format!("expected integer, found {n}")))
            }
            (Schema::String { variants }, Value::String(s)) => match variants {
                None => Ok(()),
                Some(variants) => {
                    let accepted = match mode {
                        Mode::Partial => variants.iter().any(|v| v.starts_with(s.as_str())),
                        Mode::Complete => variants.iter().any(|v| v == s),
                    };
                    if accepted {
                        Ok(())
                    } else {
                        Err(violation(
                            path,
                            format!("{s:?} is not one of {}", variants.join(", ")),
                        ))
                    }
                }
            },
            (Schema::Array(items), Value::Array(values)) => {
                for (idx, item) in values.iter().enumerate() {
                    items.validate_at(item, &format!("{path}[{idx}]"), mode)?;
                }
                Ok(())
            }
            (Schema::Object(object), Value::Object(map)) => object.validate_map(map, path, mode),
            (expected, found) => Err(violation(
                path,
                format!("expected {}, found {}", expected.kind(), kind_of(found)),
            )),
        }
    }

    /// Short name of the schema kind for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Schema::Any => "any",
            Schema::Null => "null",
            Schema::Boolean => "boolean",
            Schema::Integer => "integer",
            Schema::Number => "number",
            Schema::String { .. } => "string",
            Schema::Array(_) => "array",
            Schema::Object(_) => "object",
            Schema::Nullable(inner) => inner.kind(),
        }
    }

    /// Renders the schema as a JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        match self {
            Schema::Any => Value::Object(Map::new()),
            Schema::Null => serde_json::json!({ "type": "null" }),
            Schema::Boolean => serde_json::json!({ "type": "boolean" }),
            Schema::Integer => serde_json::json!({ "type": "integer" }),
            Schema::Number => serde_json::json!({ "type": "number" }),
            Schema::String { variants: None } => serde_json::json!({ "type": "string" }),
            Schema::String {
                variants: Some(variants),
            } => serde_json::json!({ "type": "string", "enum": variants }),
            Schema::Array(items) => {
                serde_json::json!({ "type": "array", "items": items.to_json_schema() })
            }
            Schema::Object(object) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in &object.fields {
                    let mut rendered = field.schema.to_json_schema();
                    if let (Some(text), Value::Object(map)) = (&field.description, &mut rendered) {
                        map.insert("description".into(), Value::String(text.clone()));
                    }
                    properties.insert(field.name.clone(), rendered);
                    if field.required {
                        required.push(Value::String(field.name.clone()));
                    }
                }
                serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": object.additional_fields,
                })
            }
            Schema::Nullable(inner) => {
                let mut rendered = inner.to_json_schema();
                if let Some(Value::String(kind)) = rendered.get("type").cloned() {
                    rendered["type"] = serde_json::json!([kind, "null"]);
                    if let Some(Value::Array(variants)) = rendered.get_mut("enum") {
                        variants.push(Value::Null);
                    }
                    rendered
                } else {
                    serde_json::json!({ "anyOf": [rendered, { "type": "null" }] })
                }
            }
        }
    }

    /// Builds a schema from the supported JSON Schema subset.
    ///
    /// Understands `type` (including `[T, "null"]`), `properties`, `required`,
    /// `additionalProperties`, `items`, string `enum`, `description`,
    /// `anyOf`/`oneOf` with a `null` branch, and local `$ref`s into `$defs` or
    /// `definitions`. Recursive references are rejected.
    pub fn from_json_schema(document: &Value) -> Result<Schema, SchemaError> {
        let mut resolving = Vec::new();
        let schema = convert(document, document, "$", &mut resolving)?;
        schema.check()?;
        Ok(schema)
    }
}

impl ObjectSchema {
    fn validate_map(&self, map: &Map<String, Value>, path: &str, mode: Mode) -> Result<(), Violation> {
        for (key, value) in map {
            match self.field(key) {
                Some(field) => field.schema.validate_at(value, &child_path(path, key), mode)?,
                None if self.additional_fields => {}
                None => return Err(violation(path, format!("unexpected field `{key}`"))),
            }
        }
        if mode == Mode::Complete {
            if let Some(missing) = self
                .fields
                .iter()
                .find(|f| f.required && !map.contains_key(&f.name))
            {
                return Err(violation(
                    path,
                    format!("missing required field `{}`", missing.name),
                ));
            }
        }
        Ok(())
    }
}

fn violation(path: &str, message: impl Into<String>) -> Violation {
    Violation {
        path: path.to_string(),
        message: message.into(),
    }
}

pub(crate) fn child_path(path: &str, key: &str) -> String {
    format!("{path}.{key}")
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn convert(
    node: &Value,
    root: &Value,
    path: &str,
    resolving: &mut Vec<String>,
) -> Result<Schema, SchemaError> {
    let map = match node {
        Value::Bool(true) => return Ok(Schema::Any),
        Value::Object(map) => map,
        _ => return Err(SchemaError::new(path, "expected a schema object")),
    };

    if let Some(reference) = map.get("$ref") {
        let reference = reference
            .as_str()
            .ok_or_else(|| SchemaError::new(path, "$ref must be a string"))?;
        if resolving.iter().any(|r| r == reference) {
            return Err(SchemaError::new(
                path,
                format!("recursive $ref {reference} is not supported"),
            ));
        }
        let target = resolve_ref(root, reference)
            .ok_or_else(|| SchemaError::new(path, format!("unresolved $ref {reference}")))?;
        resolving.push(reference.to_string());
        let resolved = convert(target, root, path, resolving);
        resolving.pop();
        return resolved;
    }

    for combinator in ["anyOf", "oneOf"] {
        if let Some(branches) = map.get(combinator) {
            let branches = branches
                .as_array()
                .ok_or_else(|| SchemaError::new(path, format!("{combinator} must be an array")))?;
            let (nulls, others): (Vec<&Value>, Vec<&Value>) =
                branches.iter().partition(|b| is_null_schema(b));
            return match (nulls.len(), others.as_slice()) {
                (_, [single]) => {
                    let inner = convert(single, root, path, resolving)?;
                    Ok(if nulls.is_empty() { inner } else { inner.nullable() })
                }
                (n, []) if n > 0 => Ok(Schema::Null),
                _ => Err(SchemaError::new(
                    path,
                    format!("{combinator} is only supported as an optional wrapper"),
                )),
            };
        }
    }

    let (kind, nullable) = match map.get("type") {
        None => (None, false),
        Some(Value::String(kind)) => (Some(kind.as_str()), false),
        Some(Value::Array(kinds)) => {
            let names: Vec<&str> = kinds.iter().filter_map(Value::as_str).collect();
            let non_null: Vec<&str> = names.iter().copied().filter(|k| *k != "null").collect();
            let nullable = non_null.len() < names.len();
            match non_null.as_slice() {
                [] => (Some("null"), false),
                [single] => (Some(*single), nullable),
                _ => {
                    return Err(SchemaError::new(
                        path,
                        format!("union type {names:?} is not supported"),
                    ));
                }
            }
        }
        Some(_) => return Err(SchemaError::new(path, "type must be a string or array")),
    };

    let kind = kind.or_else(|| {
        if map.contains_key("properties") {
            Some("object")
        } else if map.contains_key("items") {
            Some("array")
        } else if map.contains_key("enum") {
            Some("string")
        } else {
            None
        }
    });

    let schema = match kind {
        None => Schema::Any,
        Some("null") => Schema::Null,
        Some("boolean") => Schema::Boolean,
        Some("integer") => Schema::Integer,
        Some("number") => Schema::Number,
        Some("string") => match map.get("enum") {
            None => Schema::string(),
            Some(Value::Array(values)) => {
                let mut variants = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        Value::String(s) => variants.push(s.clone()),
                        Value::Null => {}
                        other => {
                            return Err(SchemaError::new(
                                path,
                                format!("enum value {other} is not a string"),
                            ));
                        }
                    }
                }
                Schema::enumeration(variants)
            }
            Some(_) => return Err(SchemaError::new(path, "enum must be an array")),
        },
        Some("array") => {
            let items = match map.get("items") {
                Some(items) => convert(items, root, &format!("{path}[]"), resolving)?,
                None => Schema::Any,
            };
            Schema::array(items)
        }
        Some("object") => convert_object(map, root, path, resolving)?,
        Some(other) => {
            return Err(SchemaError::new(path, format!("unknown type `{other}`")));
        }
    };

    Ok(if nullable { schema.nullable() } else { schema })
}

fn convert_object(
    map: &Map<String, Value>,
    root: &Value,
    path: &str,
    resolving: &mut Vec<String>,
) -> Result<Schema, SchemaError> {
    let required: HashSet<&str> = match map.get("required") {
        Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
        Some(_) => return Err(SchemaError::new(path, "required must be an array")),
        None => HashSet::new(),
    };
    let mut fields = Vec::new();
    if let Some(properties) = map.get("properties") {
        let properties = properties
            .as_object()
            .ok_or_else(|| SchemaError::new(path, "properties must be an object"))?;
        for (name, node) in properties {
            let field_path = child_path(path, name);
            let schema = convert(node, root, &field_path, resolving)?;
            let description = node
                .get("description")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            fields.push(Field {
                name: name.clone(),
                schema,
                required: required.contains(name.as_str()),
                description,
            });
        }
    }
    let additional_fields = !matches!(map.get("additionalProperties"), Some(Value::Bool(false)));
    Ok(Schema::Object(ObjectSchema {
        fields,
        additional_fields,
    }))
}

fn is_null_schema(node: &Value) -> bool {
    node.get("type").and_then(Value::as_str) == Some("null")
}

fn resolve_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root);
    }
    root.pointer(pointer)
}

/// Integers in the JSON Schema sense: `3.0` and `1e2` count.
fn is_integral(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> Schema {
        Schema::object([
            Field::required("name", Schema::string()).describe("display name"),
            Field::optional(
                "items",
                Schema::array(Schema::object([Field::required("id", Schema::string())])),
            ),
            Field::optional("status", Schema::enumeration(["active", "archived"])),
        ])
    }

    #[test]
    fn partial_validation_ignores_missing_required_fields() {
        let schema = profile();
        assert!(schema.validate_partial(&json!({})).is_ok());
        assert!(schema.validate_partial(&json!({"items": [{}]})).is_ok());
        let err = schema.validate_complete(&json!({})).expect_err("name missing");
        assert_eq!(err.path, "$");
        assert!(err.message.contains("`name`"));
    }

    #[test]
    fn type_mismatch_reports_path() {
        let err = profile()
            .validate_partial(&json!({"name": "A", "items": [{"id": 7}]}))
            .expect_err("id is a number");
        assert_eq!(err.path, "$.items[0].id");
        assert_eq!(err.message, "expected string, found number");
    }

    #[test]
    fn closed_objects_reject_unknown_fields() {
        let err = profile()
            .validate_partial(&json!({"nickname": "x"}))
            .expect_err("unknown field");
        assert!(err.message.contains("nickname"));
        assert!(
            profile()
                .allow_additional_fields()
                .validate_partial(&json!({"nickname": "x"}))
                .is_ok()
        );
    }

    #[test]
    fn enum_prefixes_pass_only_while_partial() {
        let schema = profile();
        let value = json!({"name": "A", "status": "arch"});
        assert!(schema.validate_partial(&value).is_ok());
        assert!(schema.validate_complete(&value).is_err());
        assert!(schema.validate_partial(&json!({"status": "x"})).is_err());
    }

    #[test]
    fn integer_rejects_fractions() {
        assert!(Schema::integer().validate_complete(&json!(3)).is_ok());
        assert!(Schema::integer().validate_complete(&json!(3.5)).is_err());
        assert!(Schema::integer().validate_complete(&json!(3.0)).is_ok());
        let exponent: Value = serde_json::from_str("1e2").expect("number");
        assert!(Schema::integer().validate_complete(&exponent).is_ok());
        assert!(Schema::integer().nullable().validate_complete(&Value::Null).is_ok());
    }

    #[test]
    fn check_rejects_duplicate_fields() {
        let schema = Schema::object([
            Field::required("a", Schema::string()),
            Field::optional("a", Schema::number()),
        ]);
        let err = schema.check().expect_err("duplicate");
        assert!(err.message.contains("duplicate field `a`"));
    }

    #[test]
    fn json_schema_export_reimports_to_same_schema() {
        let schema = profile();
        let exported = schema.to_json_schema();
        assert_eq!(exported["properties"]["name"]["description"], "display name");
        assert_eq!(exported["additionalProperties"], false);
        let imported = Schema::from_json_schema(&exported).expect("import");
        assert_eq!(imported, schema);
    }

    #[test]
    fn imports_refs_and_nullable_variants() {
        let document = json!({
            "type": "object",
            "properties": {
                "owner": { "anyOf": [ { "$ref": "#/$defs/Person" }, { "type": "null" } ] },
                "tags": { "type": ["array", "null"], "items": { "type": "string" } }
            },
            "required": ["owner"],
            "$defs": {
                "Person": {
                    "type": "object",
                    "properties": { "id": { "type": "integer" } },
                    "required": ["id"]
                }
            }
        });
        let schema = Schema::from_json_schema(&document).expect("import");
        let Schema::Object(object) = &schema else {
            panic!("expected object schema");
        };
        assert!(object.additional_fields);
        let owner = object.field("owner").expect("owner");
        assert!(owner.required);
        assert!(matches!(&owner.schema, Schema::Nullable(inner) if matches!(**inner, Schema::Object(_))));
        assert!(schema.validate_complete(&json!({"owner": null})).is_ok());
        assert!(schema.validate_complete(&json!({"owner": {"id": 1}, "tags": ["a"]})).is_ok());
    }

    #[test]
    fn recursive_refs_are_rejected() {
        let document = json!({
            "$ref": "#/$defs/Node",
            "$defs": {
                "Node": {
                    "type": "object",
                    "properties": { "next": { "$ref": "#/$defs/Node" } }
                }
            }
        });
        let err = Schema::from_json_schema(&document).expect_err("recursive");
        assert!(err.message.contains("recursive"));
    }
}
