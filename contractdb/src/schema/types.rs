use crate::error::{ContractDbError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// A query/validation schema: JSON Schema plus the `$$links` extension.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Bool(bool),
    Object(Box<SchemaObject>),
}

/// The keywords the compiler understands. Anything else in the source
/// document is descriptive and dropped while parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchemaObject {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub types: Option<TypeSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Schema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_of: Option<Vec<Schema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<Schema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not: Option<Schema>,
    #[serde(
        rename = "const",
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub const_value: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regexp: Option<Regexp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text_search: Option<FullTextSearch>,
    #[serde(rename = "$$links", skip_serializing_if = "Option::is_none")]
    pub links: Option<BTreeMap<String, Schema>>,
}

/// `const: null` is a real constraint, so keep it distinct from absence.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSet {
    Single(JsonType),
    Many(Vec<JsonType>),
}

impl TypeSet {
    pub fn to_vec(&self) -> Vec<JsonType> {
        match self {
            TypeSet::Single(t) => vec![*t],
            TypeSet::Many(ts) => ts.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Object,
    Array,
    Number,
    Integer,
    String,
}

impl JsonType {
    /// The name `jsonb_typeof` reports for values of this type.
    pub fn sql_name(&self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::Number | JsonType::Integer => "number",
            JsonType::String => "string",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => value
                .as_f64()
                .map(|n| n.fract() == 0.0)
                .unwrap_or(false),
            JsonType::String => value.is_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regexp {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

impl Regexp {
    pub fn case_insensitive(&self) -> bool {
        self.flags.as_deref().map(|f| f.contains('i')).unwrap_or(false)
    }
}

/// Either a search (`{ term }`) or, in type schemas, a bare `true` marking
/// the field as searchable. Only the former constrains anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FullTextSearch {
    Marker(bool),
    Search { term: String },
}

impl FullTextSearch {
    pub fn term(&self) -> Option<&str> {
        match self {
            FullTextSearch::Search { term } => Some(term),
            FullTextSearch::Marker(_) => None,
        }
    }
}

impl Schema {
    /// Parse a schema from JSON. A keyword with the wrong shape is a
    /// compile error.
    pub fn from_value(value: Value) -> Result<Schema> {
        match value {
            Value::Bool(b) => Ok(Schema::Bool(b)),
            Value::Object(_) => {
                let object: SchemaObject = serde_json::from_value(value)
                    .map_err(|e| ContractDbError::Compile(format!("Malformed schema: {e}")))?;
                Ok(Schema::Object(Box::new(object)))
            }
            other => Err(ContractDbError::Compile(format!(
                "Malformed schema: expected an object or a boolean, got {other}"
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Schema::Bool(b) => Value::Bool(*b),
            Schema::Object(object) => serde_json::to_value(object.as_ref())
                .unwrap_or_else(|_| Value::Object(Default::default())),
        }
    }

    pub fn object(object: SchemaObject) -> Schema {
        Schema::Object(Box::new(object))
    }

    /// `{ allOf: [...] }`
    pub fn all_of(branches: Vec<Schema>) -> Schema {
        Schema::object(SchemaObject {
            all_of: Some(branches),
            ..Default::default()
        })
    }

    /// `{ anyOf: [...] }`
    pub fn any_of(branches: Vec<Schema>) -> Schema {
        Schema::object(SchemaObject {
            any_of: Some(branches),
            ..Default::default()
        })
    }

    pub fn as_object(&self) -> Option<&SchemaObject> {
        match self {
            Schema::Object(object) => Some(object),
            Schema::Bool(_) => None,
        }
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Schema::Bool(false))
    }
}

impl Default for Schema {
    fn default() -> Self {
        Schema::Bool(true)
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Schema::Bool(b) => serializer.serialize_bool(*b),
            Schema::Object(object) => object.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Schema::from_value(value).map_err(D::Error::custom)
    }
}
