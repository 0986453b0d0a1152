// Selection trees - which properties and links a query returns

use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The shape of a query's output. An empty `properties` map selects the
/// whole value; `links` lists the link types to materialize, each with the
/// selection for the linked contracts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectMap {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SelectMap>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, SelectMap>,
}

impl SelectMap {
    /// Derive the selection from a schema: every property named by
    /// `required` or `properties`, every `$$links` type, and everything any
    /// `allOf` / `anyOf` / `not` branch selects.
    pub fn from_schema(schema: &Schema) -> SelectMap {
        let Schema::Object(object) = schema else {
            return SelectMap::default();
        };

        let mut selected = SelectMap::default();

        if let Some(links) = &object.links {
            for (link_type, linked) in links {
                selected.links.insert(link_type.clone(), SelectMap::from_schema(linked));
            }
        }
        if let Some(required) = &object.required {
            for name in required {
                selected.properties.entry(name.clone()).or_default();
            }
        }
        if let Some(properties) = &object.properties {
            for (name, property) in properties {
                let sub = SelectMap::from_schema(property);
                let entry = selected.properties.entry(name.clone()).or_default();
                entry.merge(SelectMap {
                    properties: sub.properties,
                    links: BTreeMap::new(),
                });
                // Links found below a property belong to the contract
                for (link_type, linked) in sub.links {
                    selected.links.entry(link_type).or_default().merge(linked);
                }
            }
        }

        let branches = object
            .all_of
            .iter()
            .flatten()
            .chain(object.any_of.iter().flatten())
            .chain(object.not.iter());
        for branch in branches {
            selected.merge(SelectMap::from_schema(branch));
        }

        selected
    }

    /// Union `other` into this selection.
    pub fn merge(&mut self, other: SelectMap) {
        merge_maps(&mut self.properties, other.properties);
        merge_maps(&mut self.links, other.links);
    }

    /// Drop everything not also present in `allowed`.
    pub fn rectify(&mut self, allowed: &SelectMap) {
        rectify_map(&mut self.properties, &allowed.properties);
        rectify_map(&mut self.links, &allowed.links);
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.links.is_empty()
    }

    /// Keep the selected parts of `value`. Selected properties that `value`
    /// does not have are left out rather than returned as `null`. Links are
    /// not touched here; they come from the joins.
    pub fn project(&self, value: &Value) -> Value {
        if self.properties.is_empty() {
            return value.clone();
        }
        let Value::Object(object) = value else {
            return value.clone();
        };
        let mut projected = Map::new();
        for (key, sub) in &self.properties {
            if let Some(v) = object.get(key) {
                projected.insert(key.clone(), sub.project(v));
            }
        }
        Value::Object(projected)
    }
}

fn merge_maps(base: &mut BTreeMap<String, SelectMap>, extra: BTreeMap<String, SelectMap>) {
    for (key, value) in extra {
        base.entry(key).or_default().merge(value);
    }
}

fn rectify_map(selected: &mut BTreeMap<String, SelectMap>, allowed: &BTreeMap<String, SelectMap>) {
    selected.retain(|key, sub| match allowed.get(key) {
        Some(allowed_sub) => {
            sub.rectify(allowed_sub);
            true
        }
        None => false,
    });
}
