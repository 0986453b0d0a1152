// Views - stored queries

use crate::error::{ContractDbError, Result};
use crate::schema::Schema;
use serde_json::Value;

pub const VIEW_TYPE: &str = "view@1.0.0";

/// Whether a query document is a view contract rather than a schema.
pub fn is_view(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(VIEW_TYPE)
}

/// The schema a view stands for: `data.schema` when it has one, else every
/// `data.allOf[*].schema` conjoined with the disjunction of
/// `data.anyOf[*].schema`.
pub fn view_schema(view: &Value) -> Result<Schema> {
    let slug = view.get("slug").and_then(Value::as_str).unwrap_or_default();
    let data = view.get("data").unwrap_or(&Value::Null);

    if let Some(schema) = data.get("schema").filter(|s| !s.is_null()) {
        return Schema::from_value(schema.clone());
    }

    let schemas = |key: &str| -> Result<Vec<Schema>> {
        let mut out = Vec::new();
        for (index, entry) in data.get(key).and_then(Value::as_array).into_iter().flatten().enumerate() {
            let schema = entry.get("schema").ok_or_else(|| {
                ContractDbError::Compile(format!("View {slug} has no schema in {key}[{index}]"))
            })?;
            out.push(Schema::from_value(schema.clone())?);
        }
        Ok(out)
    };

    let mut conjunctions = schemas("allOf")?;
    let disjunctions = schemas("anyOf")?;
    if !disjunctions.is_empty() {
        conjunctions.push(Schema::any_of(disjunctions));
    }
    Ok(match conjunctions.len() {
        0 => Schema::Bool(true),
        1 => conjunctions.remove(0),
        _ => Schema::all_of(conjunctions),
    })
}

/// Turn a query document into a schema, expanding views.
pub fn query_schema(query: &Value) -> Result<Schema> {
    if is_view(query) {
        view_schema(query)
    } else {
        Schema::from_value(query.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_all_of_and_any_of() {
        let view = json!({
            "slug": "view-open-threads",
            "type": "view@1.0.0",
            "data": {
                "allOf": [
                    { "name": "threads", "schema": { "properties": { "type": { "const": "thread@1.0.0" } } } },
                    { "name": "open", "schema": { "properties": { "active": { "const": true } } } }
                ],
                "anyOf": [
                    { "name": "mine", "schema": { "required": ["name"] } },
                    { "name": "tagged", "schema": { "required": ["tags"] } }
                ]
            }
        });
        assert!(is_view(&view));
        assert_eq!(
            view_schema(&view).unwrap().to_value(),
            json!({
                "allOf": [
                    { "properties": { "type": { "const": "thread@1.0.0" } } },
                    { "properties": { "active": { "const": true } } },
                    { "anyOf": [{ "required": ["name"] }, { "required": ["tags"] }] }
                ]
            })
        );
    }

    #[test]
    fn test_single_branch_and_empty_view() {
        let view = json!({
            "type": "view@1.0.0",
            "data": { "allOf": [{ "name": "all", "schema": { "required": ["slug"] } }] }
        });
        assert_eq!(view_schema(&view).unwrap().to_value(), json!({ "required": ["slug"] }));

        let empty = json!({ "type": "view@1.0.0", "data": {} });
        assert_eq!(view_schema(&empty).unwrap(), Schema::Bool(true));
    }

    #[test]
    fn test_branch_without_schema() {
        let view = json!({ "slug": "broken", "type": "view@1.0.0", "data": { "anyOf": [{ "name": "x" }] } });
        assert!(matches!(view_schema(&view), Err(ContractDbError::Compile(_))));
    }

    #[test]
    fn test_plain_schema_passes_through() {
        let schema = json!({ "type": "object", "required": ["slug"] });
        assert!(!is_view(&schema));
        assert_eq!(query_schema(&schema).unwrap().to_value(), schema);
    }
}
