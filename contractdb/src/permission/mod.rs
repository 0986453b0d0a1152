// Permissions - what a session may see, expressed as a schema every
// query is merged with

use crate::backend::Backend;
use crate::contract::{Contract, VersionRef};
use crate::error::{ContractDbError, Result};
use crate::schema::{JsonType, Schema, SchemaObject, TypeSet};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Link from a user to the orgs whose markers it carries.
pub const MEMBERSHIP_LINK: &str = "is member of";

/// The actor behind a session.
#[derive(Debug, Clone)]
pub struct Actor {
    pub contract: Contract,
    /// Role slugs without the `role-` prefix, the actor's own slug first.
    pub roles: Vec<String>,
    /// Markers the actor may see: its own slug and those of its orgs.
    pub markers: Vec<String>,
    /// Extra restriction carried by the session itself.
    pub scope: Option<Schema>,
}

/// Resolve a session id to its actor.
pub fn resolve_actor<B: Backend>(backend: &B, session_id: &str) -> Result<Actor> {
    let invalid = || ContractDbError::InvalidSession(format!("Invalid session: {session_id}"));

    let session = backend.get_element_by_id(session_id)?.ok_or_else(invalid)?;
    if !session.contract_type.starts_with("session@") || !session.active {
        return Err(invalid());
    }
    if let Some(expiration) = session.data.get("expiration").and_then(Value::as_str) {
        let expired = DateTime::parse_from_rfc3339(expiration)
            .map(|at| at.with_timezone(&Utc) <= Utc::now())
            .unwrap_or(true);
        if expired {
            return Err(ContractDbError::InvalidSession(format!("Session expired: {session_id}")));
        }
    }

    let actor_id = session
        .data
        .get("actor")
        .and_then(Value::as_str)
        .ok_or_else(invalid)?;
    let actor = backend.get_element_by_id(actor_id)?.ok_or_else(invalid)?;

    let mut roles = vec![actor.slug.clone()];
    for role in actor.data.get("roles").and_then(Value::as_array).into_iter().flatten() {
        if let Some(role) = role.as_str() {
            if !roles.iter().any(|r| r == role) {
                roles.push(role.to_string());
            }
        }
    }

    let mut markers = vec![actor.slug.clone()];
    for org in backend.get_links(&actor.id, MEMBERSHIP_LINK)? {
        if org.contract_type.starts_with("org@") && !markers.contains(&org.slug) {
            markers.push(org.slug);
        }
    }

    let scope = match session.data.get("scope") {
        Some(Value::Object(map)) if !map.is_empty() => Some(Schema::from_value(Value::Object(map.clone()))?),
        _ => None,
    };

    Ok(Actor {
        contract: actor,
        roles,
        markers,
        scope,
    })
}

/// The schema every contract visible to the session satisfies.
pub fn get_mask<B: Backend>(backend: &B, session_id: &str) -> Result<Schema> {
    let actor = resolve_actor(backend, session_id)?;
    mask_for(backend, &actor)
}

pub fn mask_for<B: Backend>(backend: &B, actor: &Actor) -> Result<Schema> {
    let mut readable = Vec::new();
    for role in &actor.roles {
        let slug = format!("role-{role}");
        let Some(contract) = backend.get_element_by_slug(&slug, &VersionRef::Latest)? else {
            log::debug!("No role contract {slug} for {}", actor.contract.slug);
            continue;
        };
        if !contract.active {
            continue;
        }
        if let Some(read) = contract.data.get("read") {
            readable.push(Schema::from_value(read.clone())?);
        }
    }

    if readable.is_empty() {
        return Ok(Schema::Bool(false));
    }

    let mut parts = vec![Schema::any_of(readable), markers_schema(&actor.markers)];
    if let Some(scope) = &actor.scope {
        parts.push(scope.clone());
    }
    Ok(Schema::all_of(parts))
}

/// Every marker of a contract must be one the actor may see.
pub fn markers_schema(markers: &[String]) -> Schema {
    let item = Schema::object(SchemaObject {
        types: Some(TypeSet::Single(JsonType::String)),
        enum_values: Some(markers.iter().cloned().map(Value::String).collect()),
        ..Default::default()
    });
    let property = Schema::object(SchemaObject {
        types: Some(TypeSet::Single(JsonType::Array)),
        items: Some(item),
        ..Default::default()
    });
    Schema::object(SchemaObject {
        properties: Some(BTreeMap::from([("markers".to_string(), property)])),
        ..Default::default()
    })
}

/// `allOf: [mask, query]` with what the mask forbids pruned out of the query.
/// Linked contracts are masked the same way.
pub fn merge(mask: &Schema, query: &Schema) -> Schema {
    Schema::all_of(vec![mask.clone(), prune(query, mask)])
}

/// Drop the properties of `query` that `mask` never lets through, so that
/// they are neither selected nor tested.
pub fn prune(query: &Schema, mask: &Schema) -> Schema {
    let Schema::Object(object) = query else {
        return query.clone();
    };
    let mut pruned = object.as_ref().clone();

    if let Some(properties) = pruned.properties.take() {
        let kept = properties
            .into_iter()
            .filter(|(key, _)| !forbids(mask, key))
            .map(|(key, property)| {
                let sub_mask = property_mask(mask, &key);
                let property = prune(&property, &sub_mask);
                (key, property)
            })
            .collect();
        pruned.properties = Some(kept);
    }
    if let Some(required) = pruned.required.as_mut() {
        required.retain(|key| !forbids(mask, key));
    }
    for branches in [pruned.all_of.as_mut(), pruned.any_of.as_mut()].into_iter().flatten() {
        for branch in branches.iter_mut() {
            *branch = prune(branch, mask);
        }
    }
    if let Some(negated) = pruned.not.as_mut() {
        *negated = prune(negated, mask);
    }
    if let Some(links) = pruned.links.as_mut() {
        for linked in links.values_mut() {
            *linked = merge(mask, linked);
        }
    }

    Schema::object(pruned)
}

/// Whether no value of property `key` can get past `mask`.
pub fn forbids(mask: &Schema, key: &str) -> bool {
    let Schema::Object(object) = mask else {
        return mask.is_false();
    };
    match object.properties.as_ref().and_then(|p| p.get(key)) {
        Some(property) if property.is_false() => return true,
        Some(_) => {}
        None => {
            if object.additional_properties.as_ref().is_some_and(Schema::is_false) {
                return true;
            }
        }
    }
    if object.all_of.iter().flatten().any(|branch| forbids(branch, key)) {
        return true;
    }
    match &object.any_of {
        Some(branches) if !branches.is_empty() => branches.iter().all(|branch| forbids(branch, key)),
        _ => false,
    }
}

/// Remove from a query result every property `mask` never lets through.
/// Materialized links are redacted contract by contract.
pub fn redact(mask: &Schema, contract: Value) -> Value {
    redact_value(mask, contract, true)
}

fn redact_value(mask: &Schema, value: Value, row: bool) -> Value {
    let Value::Object(object) = value else {
        return value;
    };
    let kept: Map<String, Value> = object
        .into_iter()
        .filter_map(|(key, value)| {
            if row && key == "links" {
                return Some((key, redact_links(mask, value)));
            }
            if forbids(mask, &key) {
                return None;
            }
            let sub_mask = property_mask(mask, &key);
            let value = redact_value(&sub_mask, value, false);
            Some((key, value))
        })
        .collect();
    Value::Object(kept)
}

fn redact_links(mask: &Schema, links: Value) -> Value {
    let Value::Object(links) = links else {
        return links;
    };
    let redacted = links
        .into_iter()
        .map(|(link_type, linked)| match linked {
            Value::Array(contracts) => (
                link_type,
                Value::Array(contracts.into_iter().map(|c| redact(mask, c)).collect()),
            ),
            other => (link_type, other),
        })
        .collect();
    Value::Object(redacted)
}

/// The part of `mask` that applies to the value of property `key`.
fn property_mask(mask: &Schema, key: &str) -> Schema {
    let Schema::Object(object) = mask else {
        return mask.clone();
    };
    let mut parts = Vec::new();
    match object.properties.as_ref().and_then(|p| p.get(key)) {
        Some(property) => parts.push(property.clone()),
        None => {
            if let Some(additional) = &object.additional_properties {
                parts.push(additional.clone());
            }
        }
    }
    for branch in object.all_of.iter().flatten() {
        parts.push(property_mask(branch, key));
    }
    if let Some(branches) = object.any_of.as_ref().filter(|b| !b.is_empty()) {
        parts.push(Schema::any_of(
            branches.iter().map(|branch| property_mask(branch, key)).collect(),
        ));
    }
    match parts.len() {
        0 => Schema::Bool(true),
        1 => parts.remove(0),
        _ => Schema::all_of(parts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::select::SelectMap;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema(value: Value) -> Schema {
        Schema::from_value(value).unwrap()
    }

    fn insert(backend: &SqliteBackend, value: Value) -> Contract {
        backend.insert_element(&Contract::from_partial(value).unwrap()).unwrap()
    }

    #[test]
    fn test_forbids() {
        let mask = schema(json!({
            "anyOf": [
                { "additionalProperties": false, "properties": { "slug": true, "data": true } },
                { "properties": { "data": false, "slug": true }, "additionalProperties": false }
            ]
        }));
        assert!(!forbids(&mask, "slug"));
        assert!(!forbids(&mask, "data"));
        assert!(forbids(&mask, "name"));

        let mask = schema(json!({ "allOf": [true, { "properties": { "data": false } }] }));
        assert!(forbids(&mask, "data"));
        assert!(!forbids(&mask, "slug"));
    }

    #[test]
    fn test_prune_drops_forbidden_properties() {
        let mask = schema(json!({
            "additionalProperties": false,
            "properties": {
                "slug": true,
                "data": { "additionalProperties": false, "properties": { "open": true } }
            }
        }));
        let query = schema(json!({
            "required": ["slug", "name"],
            "properties": {
                "name": { "const": "x" },
                "data": { "properties": { "open": true, "secret": { "const": 1 } } }
            }
        }));
        let pruned = prune(&query, &mask);
        assert_eq!(
            pruned.to_value(),
            json!({
                "required": ["slug"],
                "properties": { "data": { "properties": { "open": true } } }
            })
        );

        let mut selected = SelectMap::from_schema(&query);
        selected.rectify(&SelectMap::from_schema(&merge(&mask, &query)));
        assert!(selected.properties.contains_key("data"));
        assert!(!selected.properties.contains_key("name"));
        assert!(!selected.properties["data"].properties.contains_key("secret"));
    }

    #[test]
    fn test_redact() {
        let mask = schema(json!({
            "anyOf": [{
                "additionalProperties": false,
                "properties": {
                    "slug": true,
                    "links": true,
                    "data": { "additionalProperties": false, "properties": { "open": true } }
                }
            }]
        }));
        let contract = json!({
            "slug": "foo",
            "name": "hidden",
            "data": { "open": 1, "secret": 2 },
            "links": { "is attached to": [{ "slug": "bar", "name": "hidden too" }] }
        });
        assert_eq!(
            redact(&mask, contract),
            json!({
                "slug": "foo",
                "data": { "open": 1 },
                "links": { "is attached to": [{ "slug": "bar" }] }
            })
        );
        assert_eq!(redact(&Schema::Bool(false), json!({ "slug": "foo" })), json!({}));
    }

    #[test]
    fn test_linked_contracts_are_masked() {
        let mask = schema(json!({ "properties": { "markers": { "maxItems": 0 } } }));
        let query = schema(json!({ "$$links": { "has member": { "required": ["slug"] } } }));
        let pruned = prune(&query, &mask);
        let linked = &pruned.as_object().unwrap().links.as_ref().unwrap()["has member"];
        assert_eq!(linked.as_object().unwrap().all_of.as_ref().unwrap()[0], mask);
    }

    #[test]
    fn test_mask_for_session() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        insert(&backend, json!({
            "slug": "role-user-jane",
            "type": "role@1.0.0",
            "data": { "read": { "required": ["slug"] } }
        }));
        insert(&backend, json!({
            "slug": "role-user-community",
            "type": "role@1.0.0",
            "data": { "read": { "properties": { "type": { "const": "card@1.0.0" } } } }
        }));
        let jane = insert(&backend, json!({
            "slug": "user-jane",
            "type": "user@1.0.0",
            "data": { "roles": ["user-community", "user-missing"] }
        }));
        let org = insert(&backend, json!({ "slug": "org-acme", "type": "org@1.0.0", "name": "Acme" }));
        insert(&backend, json!({
            "slug": "link-jane-acme",
            "type": "link@1.0.0",
            "name": "is member of",
            "data": {
                "inverseName": "has member",
                "from": { "id": jane.id, "type": "user@1.0.0" },
                "to": { "id": org.id, "type": "org@1.0.0" }
            }
        }));
        let session = insert(&backend, json!({
            "slug": "session-jane",
            "type": "session@1.0.0",
            "data": { "actor": jane.id }
        }));

        let actor = resolve_actor(&backend, &session.id).unwrap();
        assert_eq!(actor.roles, vec!["user-jane", "user-community", "user-missing"]);
        assert_eq!(actor.markers, vec!["user-jane", "org-acme"]);

        let mask = get_mask(&backend, &session.id).unwrap();
        let branches = mask.as_object().unwrap().all_of.as_ref().unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].as_object().unwrap().any_of.as_ref().unwrap().len(), 2);
        assert_eq!(branches[1], markers_schema(&actor.markers));
    }

    #[test]
    fn test_unknown_session() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let result = get_mask(&backend, "4a962ad9-20b5-4dd8-a707-bf819593cc84");
        assert!(matches!(result, Err(ContractDbError::InvalidSession(_))));
    }

    #[test]
    fn test_expired_session() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let user = insert(&backend, json!({ "slug": "user-jane", "type": "user@1.0.0" }));
        let session = insert(&backend, json!({
            "slug": "session-old",
            "type": "session@1.0.0",
            "data": { "actor": user.id, "expiration": "2001-01-01T00:00:00Z" }
        }));
        let result = resolve_actor(&backend, &session.id);
        assert!(matches!(result, Err(ContractDbError::InvalidSession(_))));
    }

    #[test]
    fn test_actor_without_roles_sees_nothing() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let user = insert(&backend, json!({ "slug": "user-nobody", "type": "user@1.0.0" }));
        let session = insert(&backend, json!({
            "slug": "session-nobody",
            "type": "session@1.0.0",
            "data": { "actor": user.id }
        }));
        assert_eq!(get_mask(&backend, &session.id).unwrap(), Schema::Bool(false));
    }
}
