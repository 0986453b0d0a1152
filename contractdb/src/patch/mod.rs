// JSON Patch (RFC 6902) over contracts

use crate::error::{ContractDbError, Result};
use crate::sql::json_equal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level properties a patch never changes. Operations on them are
/// skipped.
pub const IMMUTABLE_PROPERTIES: &[&str] = &["id", "links", "linked_at", "created_at", "updated_at"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }

    /// The path that must already exist for the operation to apply.
    fn source(&self) -> Option<&str> {
        match self {
            PatchOperation::Add { .. } => None,
            PatchOperation::Move { from, .. } | PatchOperation::Copy { from, .. } => Some(from),
            PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Test { path, .. } => Some(path),
        }
    }

    fn touches_immutable(&self) -> bool {
        let moved_from = match self {
            PatchOperation::Move { from, .. } => is_immutable(from),
            _ => false,
        };
        moved_from || is_immutable(self.path())
    }
}

/// Parse a JSON array of patch operations.
pub fn parse_patch(value: Value) -> Result<Vec<PatchOperation>> {
    serde_json::from_value(value).map_err(|e| ContractDbError::InvalidPatch(format!("Malformed patch: {e}")))
}

pub fn is_immutable(path: &str) -> bool {
    match parse_pointer(path) {
        Ok(tokens) => tokens
            .first()
            .map(|first| IMMUTABLE_PROPERTIES.contains(&first.as_str()))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Apply `operations` to a copy of `contract`.
///
/// Operations on immutable properties are skipped. Operations other than
/// `add` on a path the contract lacks are a schema mismatch: they usually
/// come from trying to reach past the permission filter.
pub fn apply_patch(contract: &Value, operations: &[PatchOperation]) -> Result<Value> {
    let slug = contract.get("slug").and_then(Value::as_str).unwrap_or_default().to_string();
    let mut patched = contract.clone();

    for operation in operations {
        if operation.touches_immutable() {
            log::debug!("Skipping patch of immutable path {} on {slug}", operation.path());
            continue;
        }
        if let Some(source) = operation.source() {
            let tokens = parse_pointer(source)?;
            if lookup(&patched, &tokens).is_none() {
                return Err(ContractDbError::SchemaMismatch(format!(
                    "Path {source} does not exist in {slug}"
                )));
            }
        }
        apply_operation(&mut patched, operation)
            .map_err(|e| ContractDbError::InvalidPatch(format!("Patch does not apply to {slug}: {e}")))?;
    }

    Ok(patched)
}

fn apply_operation(doc: &mut Value, operation: &PatchOperation) -> std::result::Result<(), String> {
    match operation {
        PatchOperation::Add { path, value } => add(doc, &tokens(path)?, value.clone()),
        PatchOperation::Remove { path } => remove(doc, &tokens(path)?).map(|_| ()),
        PatchOperation::Replace { path, value } => {
            let tokens = tokens(path)?;
            let target = lookup_mut(doc, &tokens).ok_or_else(|| format!("{path} does not exist"))?;
            *target = value.clone();
            Ok(())
        }
        PatchOperation::Move { from, path } => {
            if path.starts_with(&format!("{from}/")) {
                return Err(format!("cannot move {from} into itself"));
            }
            let value = remove(doc, &tokens(from)?)?;
            add(doc, &tokens(path)?, value)
        }
        PatchOperation::Copy { from, path } => {
            let value = lookup(doc, &tokens(from)?)
                .cloned()
                .ok_or_else(|| format!("{from} does not exist"))?;
            add(doc, &tokens(path)?, value)
        }
        PatchOperation::Test { path, value } => match lookup(doc, &tokens(path)?) {
            Some(actual) if json_equal(actual, value) => Ok(()),
            _ => Err(format!("test failed at {path}")),
        },
    }
}

fn tokens(path: &str) -> std::result::Result<Vec<String>, String> {
    let tokens = parse_pointer(path).map_err(|e| e.to_string())?;
    if tokens.is_empty() {
        return Err("the whole contract cannot be patched".into());
    }
    Ok(tokens)
}

/// Split a JSON pointer into unescaped reference tokens.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(ContractDbError::InvalidPatch(format!("Invalid path: {pointer}")));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn lookup<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => array_index(token, items.len()).and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get_mut(token),
        Value::Array(items) => {
            let len = items.len();
            array_index(token, len).and_then(move |i| items.get_mut(i))
        }
        _ => None,
    })
}

fn array_index(token: &str, len: usize) -> Option<usize> {
    if token.len() > 1 && token.starts_with('0') {
        return None;
    }
    token.parse::<usize>().ok().filter(|i| *i < len)
}

fn add(doc: &mut Value, tokens: &[String], value: Value) -> std::result::Result<(), String> {
    let Some((last, parents)) = tokens.split_last() else {
        return Err("empty path".into());
    };
    let parent = lookup_mut(doc, parents).ok_or_else(|| format!("parent of /{} does not exist", tokens.join("/")))?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            match last.parse::<usize>() {
                Ok(index) if index <= items.len() => {
                    items.insert(index, value);
                    Ok(())
                }
                _ => Err(format!("invalid array index {last}")),
            }
        }
        _ => Err(format!("cannot add {last} to a scalar")),
    }
}

fn remove(doc: &mut Value, tokens: &[String]) -> std::result::Result<Value, String> {
    let Some((last, parents)) = tokens.split_last() else {
        return Err("empty path".into());
    };
    let parent = lookup_mut(doc, parents).ok_or_else(|| format!("parent of /{} does not exist", tokens.join("/")))?;
    match parent {
        Value::Object(map) => map.remove(last).ok_or_else(|| format!("{last} does not exist")),
        Value::Array(items) => match array_index(last, items.len()) {
            Some(index) => Ok(items.remove(index)),
            None => Err(format!("invalid array index {last}")),
        },
        _ => Err(format!("cannot remove {last} from a scalar")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn contract() -> Value {
        json!({
            "id": "4a962ad9-20b5-4dd8-a707-bf819593cc84",
            "slug": "foo",
            "type": "card@1.0.0",
            "tags": ["a", "b"],
            "data": { "count": 1, "nested": { "x": true } }
        })
    }

    fn patch(ops: Value) -> Vec<PatchOperation> {
        parse_patch(ops).unwrap()
    }

    #[test]
    fn test_add_replace_remove() {
        let patched = apply_patch(
            &contract(),
            &patch(json!([
                { "op": "add", "path": "/data/new", "value": 5 },
                { "op": "replace", "path": "/data/count", "value": 2 },
                { "op": "remove", "path": "/data/nested/x" },
                { "op": "add", "path": "/tags/-", "value": "c" },
                { "op": "add", "path": "/tags/0", "value": "z" }
            ])),
        )
        .unwrap();
        assert_eq!(patched["data"], json!({ "count": 2, "new": 5, "nested": {} }));
        assert_eq!(patched["tags"], json!(["z", "a", "b", "c"]));
    }

    #[test]
    fn test_move_copy_test() {
        let patched = apply_patch(
            &contract(),
            &patch(json!([
                { "op": "test", "path": "/data/count", "value": 1.0 },
                { "op": "copy", "from": "/data/count", "path": "/data/copied" },
                { "op": "move", "from": "/data/nested", "path": "/data/moved" }
            ])),
        )
        .unwrap();
        assert_eq!(patched["data"], json!({ "count": 1, "copied": 1, "moved": { "x": true } }));
    }

    #[test]
    fn test_immutable_paths_are_skipped() {
        let original = contract();
        let patched = apply_patch(
            &original,
            &patch(json!([
                { "op": "replace", "path": "/id", "value": "other" },
                { "op": "add", "path": "/links/is attached to", "value": [] },
                { "op": "add", "path": "/created_at", "value": "2020-01-01T00:00:00Z" },
                { "op": "replace", "path": "/slug", "value": "bar" }
            ])),
        )
        .unwrap();
        assert_eq!(patched["id"], original["id"]);
        assert!(patched.get("links").is_none());
        assert!(patched.get("created_at").is_none());
        assert_eq!(patched["slug"], "bar");
    }

    #[test]
    fn test_missing_path_is_schema_mismatch() {
        let result = apply_patch(
            &contract(),
            &patch(json!([{ "op": "replace", "path": "/data/secret", "value": 1 }])),
        );
        assert!(matches!(result, Err(ContractDbError::SchemaMismatch(_))));
    }

    #[test]
    fn test_failed_application_is_invalid_patch() {
        let result = apply_patch(
            &contract(),
            &patch(json!([{ "op": "test", "path": "/data/count", "value": 7 }])),
        );
        assert!(matches!(result, Err(ContractDbError::InvalidPatch(_))));

        let result = apply_patch(
            &contract(),
            &patch(json!([{ "op": "add", "path": "/data/missing/deep", "value": 1 }])),
        );
        assert!(matches!(result, Err(ContractDbError::InvalidPatch(_))));
    }

    #[test]
    fn test_operation_without_path_is_rejected() {
        let result = parse_patch(json!([{ "op": "add", "value": 1 }]));
        assert!(matches!(result, Err(ContractDbError::InvalidPatch(_))));
    }

    #[test]
    fn test_pointer_escapes() {
        assert_eq!(parse_pointer("/a~1b/c~0d").unwrap(), vec!["a/b", "c~d"]);
        assert!(parse_pointer("no-slash").is_err());
        assert!(is_immutable("/linked_at/has member"));
        assert!(!is_immutable("/identity"));
    }
}
