//! # Schema Document & Validator
//!
//! The codec treats payload validation as a black box behind [`Validator`].
//! [`SchemaValidator`] is the stock implementation: it walks a JSON value
//! against a [`Schema`] tree loaded from the proto document.
//!
//! ## Invariants
//! - **Recursion Safety**: validation depth is bounded by `MAX_RECURSION_DEPTH`,
//!   which also stops reference cycles in a hostile schema document.
//! - **Strict Objects**: unknown properties are rejected unless the object schema
//!   opts into `additional`.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// The maximum nesting depth for values and references before giving up.
const MAX_RECURSION_DEPTH: usize = 64;

/// One node of a schema tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    Any,
    Boolean,
    Number,
    Integer,
    String,
    Null,
    Literal { value: Value },
    Array { items: Box<Schema> },
    Object {
        #[serde(default)]
        properties: BTreeMap<String, Schema>,
        #[serde(default)]
        optional: Vec<String>,
        #[serde(default)]
        additional: bool,
    },
    Union { members: Vec<Schema> },
    /// Points at another entry of the same [`SchemaDoc`].
    Reference { target: String },
}

impl Schema {
    fn describe(&self) -> &'static str {
        match self {
            Schema::Any => "any",
            Schema::Boolean => "boolean",
            Schema::Number => "number",
            Schema::Integer => "integer",
            Schema::String => "string",
            Schema::Null => "null",
            Schema::Literal { .. } => "literal",
            Schema::Array { .. } => "array",
            Schema::Object { .. } => "object",
            Schema::Union { .. } => "union",
            Schema::Reference { .. } => "reference",
        }
    }
}

/// Schema ids mapped to their schema trees, e.g. `"user/PtlLogin/ReqLogin"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDoc {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, schema: Schema) {
        self.schemas.insert(id.into(), schema);
    }

    pub fn get(&self, id: &str) -> Option<&Schema> {
        self.schemas.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.schemas.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Validation failures.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// The schema id is not in the document.
    UnknownSchema(String),
    /// The value has the wrong shape at `path`.
    Mismatch { path: String, expected: String, found: &'static str },
    /// A required property is absent.
    MissingProperty { path: String, name: String },
    /// A property the schema does not declare.
    UnexpectedProperty { path: String, name: String },
    /// The value or schema nested deeper than the safety limit.
    RecursionLimitExceeded,
    /// The bytes were not a JSON document.
    Malformed(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSchema(id) => write!(f, "unknown schema '{}'", id),
            Self::Mismatch { path, expected, found } => {
                write!(f, "{}: expected {}, found {}", display_path(path), expected, found)
            }
            Self::MissingProperty { path, name } => {
                write!(f, "{}: missing required property '{}'", display_path(path), name)
            }
            Self::UnexpectedProperty { path, name } => {
                write!(f, "{}: unexpected property '{}'", display_path(path), name)
            }
            Self::RecursionLimitExceeded => write!(f, "nesting exceeds {} levels", MAX_RECURSION_DEPTH),
            Self::Malformed(msg) => write!(f, "malformed body: {}", msg),
        }
    }
}

impl std::error::Error for SchemaError {}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "<root>" } else { path }
}

/// The external validator contract consumed by the frame codecs.
///
/// This trait is object-safe so codecs can hold an `Arc<dyn Validator>`.
pub trait Validator: Send + Sync + 'static {
    /// Checks `value` against the schema without serializing it.
    fn validate(&self, value: &Value, schema_id: &str) -> Result<(), SchemaError>;

    /// Validates `value` and appends its serialized form to `buf`.
    fn encode_into(&self, value: &Value, schema_id: &str, buf: &mut Vec<u8>) -> Result<(), SchemaError>;

    /// Parses `bytes` and validates the result.
    fn decode(&self, bytes: &[u8], schema_id: &str) -> Result<Value, SchemaError>;

    fn encode(&self, value: &Value, schema_id: &str) -> Result<Vec<u8>, SchemaError> {
        let mut buf = Vec::new();
        self.encode_into(value, schema_id, &mut buf)?;
        Ok(buf)
    }
}

/// Validates JSON values against a [`SchemaDoc`]; bodies are carried as compact JSON.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    doc: SchemaDoc,
}

impl SchemaValidator {
    pub fn new(doc: SchemaDoc) -> Self {
        Self { doc }
    }

    pub fn doc(&self) -> &SchemaDoc {
        &self.doc
    }

    fn resolve(&self, id: &str) -> Result<&Schema, SchemaError> {
        self.doc.get(id).ok_or_else(|| SchemaError::UnknownSchema(id.to_string()))
    }

    fn check(&self, value: &Value, schema: &Schema, path: &mut String, depth: usize) -> Result<(), SchemaError> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(SchemaError::RecursionLimitExceeded);
        }

        let mismatch = |path: &String, expected: &str| SchemaError::Mismatch {
            path: path.clone(),
            expected: expected.to_string(),
            found: value_desc(value),
        };

        match schema {
            Schema::Any => Ok(()),
            Schema::Boolean if value.is_boolean() => Ok(()),
            Schema::Number if value.is_number() => Ok(()),
            Schema::Integer if value.is_i64() || value.is_u64() => Ok(()),
            Schema::String if value.is_string() => Ok(()),
            Schema::Null if value.is_null() => Ok(()),
            Schema::Literal { value: expected } => {
                if value == expected { Ok(()) } else { Err(mismatch(path, &format!("literal {}", expected))) }
            }
            Schema::Array { items } => {
                let Some(list) = value.as_array() else { return Err(mismatch(path, "array")) };
                for (idx, item) in list.iter().enumerate() {
                    let mark = path.len();
                    path.push_str(&format!("[{}]", idx));
                    self.check(item, items, path, depth + 1)?;
                    path.truncate(mark);
                }
                Ok(())
            }
            Schema::Object { properties, optional, additional } => {
                let Some(map) = value.as_object() else { return Err(mismatch(path, "object")) };

                for (name, prop) in properties {
                    match map.get(name) {
                        // An explicit null satisfies an optional property.
                        Some(Value::Null) if optional.contains(name) => {}
                        Some(v) => {
                            let mark = path.len();
                            path.push('.');
                            path.push_str(name);
                            self.check(v, prop, path, depth + 1)?;
                            path.truncate(mark);
                        }
                        None if optional.contains(name) => {}
                        None => {
                            return Err(SchemaError::MissingProperty { path: path.clone(), name: name.clone() });
                        }
                    }
                }

                if !additional {
                    if let Some(extra) = map.keys().find(|k| !properties.contains_key(*k)) {
                        return Err(SchemaError::UnexpectedProperty { path: path.clone(), name: extra.clone() });
                    }
                }
                Ok(())
            }
            Schema::Union { members } => {
                let mark = path.len();
                for member in members {
                    let matched = self.check(value, member, path, depth + 1).is_ok();
                    path.truncate(mark);
                    if matched {
                        return Ok(());
                    }
                }
                let names: Vec<_> = members.iter().map(Schema::describe).collect();
                Err(mismatch(path, &format!("one of [{}]", names.join(", "))))
            }
            Schema::Reference { target } => {
                let target = self.resolve(target)?;
                self.check(value, target, path, depth + 1)
            }
            other => Err(mismatch(path, other.describe())),
        }
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, value: &Value, schema_id: &str) -> Result<(), SchemaError> {
        let schema = self.resolve(schema_id)?;
        let mut path = String::new();
        self.check(value, schema, &mut path, 0)
    }

    fn encode_into(&self, value: &Value, schema_id: &str, buf: &mut Vec<u8>) -> Result<(), SchemaError> {
        self.validate(value, schema_id)?;
        serde_json::to_writer(buf, value).map_err(|e| SchemaError::Malformed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8], schema_id: &str) -> Result<Value, SchemaError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        self.validate(&value, schema_id)?;
        Ok(value)
    }
}

fn value_desc(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> SchemaDoc {
        serde_json::from_value(json!({
            "Req": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "age": { "type": "integer" },
                    "tags": { "type": "array", "items": { "type": "string" } }
                },
                "optional": ["age", "tags"]
            },
            "Mode": {
                "type": "union",
                "members": [
                    { "type": "literal", "value": "fast" },
                    { "type": "literal", "value": "slow" }
                ]
            },
            "Wrapper": {
                "type": "object",
                "properties": { "inner": { "type": "reference", "target": "Req" } }
            },
            "Loop": { "type": "reference", "target": "Loop" }
        }))
        .unwrap()
    }

    #[test]
    fn test_accepts_valid_object() {
        let v = SchemaValidator::new(doc());
        v.validate(&json!({"name": "abc"}), "Req").unwrap();
        v.validate(&json!({"name": "abc", "age": 3, "tags": ["x"]}), "Req").unwrap();
        v.validate(&json!({"name": "abc", "age": null}), "Req").unwrap();
    }

    #[test]
    fn test_rejects_missing_required() {
        let v = SchemaValidator::new(doc());
        let err = v.validate(&json!({"age": 3}), "Req").unwrap_err();
        assert_eq!(err, SchemaError::MissingProperty { path: String::new(), name: "name".into() });
    }

    #[test]
    fn test_rejects_unknown_property() {
        let v = SchemaValidator::new(doc());
        let err = v.validate(&json!({"name": "a", "evil": true}), "Req").unwrap_err();
        assert!(matches!(err, SchemaError::UnexpectedProperty { name, .. } if name == "evil"));
    }

    #[test]
    fn test_reports_nested_path() {
        let v = SchemaValidator::new(doc());
        let err = v.validate(&json!({"inner": {"name": "a", "tags": ["ok", 7]}}), "Wrapper").unwrap_err();
        match err {
            SchemaError::Mismatch { path, expected, found } => {
                assert_eq!(path, ".inner.tags[1]");
                assert_eq!(expected, "string");
                assert_eq!(found, "integer");
            }
            other => panic!("Expected Mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_integer_rejects_float() {
        let v = SchemaValidator::new(doc());
        assert!(v.validate(&json!({"name": "a", "age": 1.5}), "Req").is_err());
    }

    #[test]
    fn test_union_of_literals() {
        let v = SchemaValidator::new(doc());
        v.validate(&json!("fast"), "Mode").unwrap();
        assert!(v.validate(&json!("medium"), "Mode").is_err());
    }

    #[test]
    fn test_reference_cycle_is_bounded() {
        let v = SchemaValidator::new(doc());
        assert_eq!(v.validate(&json!(1), "Loop"), Err(SchemaError::RecursionLimitExceeded));
    }

    #[test]
    fn test_unknown_schema_id() {
        let v = SchemaValidator::new(doc());
        assert_eq!(v.validate(&json!({}), "Nope"), Err(SchemaError::UnknownSchema("Nope".into())));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let v = SchemaValidator::new(doc());
        assert!(matches!(v.decode(b"{not json", "Req"), Err(SchemaError::Malformed(_))));
    }

    #[test]
    fn test_encode_validates_first() {
        let v = SchemaValidator::new(doc());
        assert!(v.encode(&json!({"name": 1}), "Req").is_err());
        let bytes = v.encode(&json!({"name": "abc"}), "Req").unwrap();
        assert_eq!(bytes, br#"{"name":"abc"}"#);
    }
}
