// Contract model - the versioned, typed JSON documents stored by the kernel

mod link;
mod version;

pub use link::{
    normalize_endpoint_types, parse_link, stamp_linked_at, LinkContract, LinkedRef, LINK_TYPE,
};
pub use version::{parse_reference, Version, VersionRef};

use crate::error::{ContractDbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default)]
    pub requires: Vec<Value>,
    #[serde(default)]
    pub capabilities: Vec<Value>,
    #[serde(default)]
    pub links: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub linked_at: BTreeMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn default_active() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Contract {
    /// Build a contract from a partial JSON definition, filling every missing
    /// field with its default. `slug` may be derived from `name`; `type` is
    /// mandatory.
    pub fn from_partial(partial: Value) -> Result<Self> {
        let mut object = match partial {
            Value::Object(map) => map,
            other => {
                return Err(ContractDbError::SchemaMismatch(format!(
                    "Contract must be an object, got {other}"
                )))
            }
        };

        match object.get("type") {
            Some(Value::String(t)) if !t.is_empty() => {}
            _ => return Err(ContractDbError::SchemaMismatch("No type in contract".into())),
        }

        let has_slug = matches!(object.get("slug"), Some(Value::String(s)) if !s.is_empty());
        if !has_slug {
            let derived = object
                .get("name")
                .and_then(Value::as_str)
                .map(slug::slugify)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ContractDbError::InvalidSlug("Slug is undefined".into()))?;
            object.insert("slug".into(), Value::String(derived));
        }

        let missing = |object: &Map<String, Value>, key: &str| {
            matches!(object.get(key), None | Some(Value::Null))
        };

        if missing(&object, "id") {
            object.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        if missing(&object, "version") {
            object.insert("version".into(), Value::String(Version::default().to_string()));
        }
        if missing(&object, "created_at") {
            object.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        }

        let contract: Contract = serde_json::from_value(Value::Object(object))
            .map_err(|e| ContractDbError::SchemaMismatch(format!("Invalid contract: {e}")))?;

        contract.validate_identity()?;
        Ok(contract)
    }

    /// Check the identity fields that the store relies on.
    pub fn validate_identity(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ContractDbError::InvalidId("Id is undefined".into()));
        }
        if self.slug.is_empty() {
            return Err(ContractDbError::InvalidSlug("Slug is undefined".into()));
        }
        Version::parse(&self.version)?;
        Ok(())
    }

    /// The parsed version of this contract.
    pub fn parsed_version(&self) -> Result<Version> {
        Version::parse(&self.version)
    }

    /// `slug@version` for this contract.
    pub fn versioned_slug(&self) -> String {
        format!("{}@{}", self.slug, self.version)
    }

    /// The contract as a JSON object, the shape queries and patches work on.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// The contract as a stored row: every column, without the
    /// materialized `links`.
    pub fn to_row(&self) -> Result<Value> {
        let mut value = self.to_value()?;
        if let Value::Object(object) = &mut value {
            object.remove("links");
        }
        Ok(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// The schema stored in a type contract.
    pub fn type_schema(&self) -> Option<&Value> {
        self.data.get("schema").filter(|s| !s.is_null())
    }
}

/// Split a type reference such as `user@1.0.0` into slug and version.
/// Unversioned references resolve to `1.0.0`.
pub fn type_reference(reference: &str) -> String {
    if reference.contains('@') {
        reference.to_string()
    } else {
        format!("{reference}@{}", Version::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_partial_applies_defaults() {
        let contract = Contract::from_partial(json!({
            "slug": "foo",
            "type": "card@1.0.0",
        }))
        .unwrap();

        assert_eq!(contract.slug, "foo");
        assert_eq!(contract.version, "1.0.0");
        assert!(contract.active);
        assert!(contract.tags.is_empty());
        assert!(contract.links.is_empty());
        assert_eq!(contract.data, json!({}));
        assert!(!contract.id.is_empty());
        assert!(contract.updated_at.is_none());
    }

    #[test]
    fn test_from_partial_keeps_given_fields() {
        let contract = Contract::from_partial(json!({
            "id": "4a962ad9-20b5-4dd8-a707-bf819593cc84",
            "slug": "foo",
            "type": "card@1.0.0",
            "version": "2.1.0",
            "active": false,
            "data": { "a": 1 },
        }))
        .unwrap();

        assert_eq!(contract.id, "4a962ad9-20b5-4dd8-a707-bf819593cc84");
        assert_eq!(contract.version, "2.1.0");
        assert!(!contract.active);
        assert_eq!(contract.data["a"], 1);
    }

    #[test]
    fn test_slug_derived_from_name() {
        let contract = Contract::from_partial(json!({
            "name": "Hello World",
            "type": "card@1.0.0",
        }))
        .unwrap();
        assert_eq!(contract.slug, "hello-world");
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let result = Contract::from_partial(json!({ "slug": "foo" }));
        assert!(matches!(result, Err(ContractDbError::SchemaMismatch(_))));
    }

    #[test]
    fn test_missing_slug_and_name_is_rejected() {
        let result = Contract::from_partial(json!({ "type": "card@1.0.0" }));
        assert!(matches!(result, Err(ContractDbError::InvalidSlug(_))));
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        let result = Contract::from_partial(json!({
            "slug": "foo",
            "type": "card@1.0.0",
            "version": "one",
        }));
        assert!(matches!(result, Err(ContractDbError::InvalidVersion(_))));
    }

    #[test]
    fn test_value_round_trip_keeps_all_columns() {
        let contract = Contract::from_partial(json!({
            "slug": "foo",
            "type": "card@1.0.0",
        }))
        .unwrap();
        let value = contract.to_value().unwrap();
        for key in ["id", "slug", "type", "version", "name", "active", "tags", "markers",
            "requires", "capabilities", "links", "linked_at", "created_at", "updated_at", "data"]
        {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(Contract::from_value(value).unwrap(), contract);
    }

    #[test]
    fn test_type_reference() {
        assert_eq!(type_reference("user"), "user@1.0.0");
        assert_eq!(type_reference("user@2.0.0"), "user@2.0.0");
    }
}
