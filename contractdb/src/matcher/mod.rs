// Running compiled queries in-process

use crate::backend::{Backend, Row};
use crate::contract::Version;
use crate::error::Result;
use crate::sql::{LinkMatches, LinkResolver, SortDir, SqlQuery, ValuePath, CONTRACT_COLUMN, ID_COLUMN};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Resolves links through the backend.
pub struct BackendLinks<'a, B: Backend> {
    backend: &'a B,
}

impl<'a, B: Backend> BackendLinks<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        BackendLinks { backend }
    }
}

impl<B: Backend> LinkResolver for BackendLinks<'_, B> {
    fn linked(&self, parent: &Value, link_type: &str) -> Result<Vec<Value>> {
        let Some(id) = parent.get("id").and_then(Value::as_str) else {
            return Ok(Vec::new());
        };
        self.backend
            .get_links(id, link_type)?
            .iter()
            .map(|c| c.to_row())
            .collect()
    }
}

/// Resolves the links of one change image from the links materialized on
/// it, and everything else through `fallback`.
pub struct ImageLinks<'a> {
    image: &'a Value,
    fallback: &'a dyn LinkResolver,
}

impl<'a> ImageLinks<'a> {
    pub fn new(image: &'a Value, fallback: &'a dyn LinkResolver) -> Self {
        ImageLinks { image, fallback }
    }
}

impl LinkResolver for ImageLinks<'_> {
    fn linked(&self, parent: &Value, link_type: &str) -> Result<Vec<Value>> {
        let is_image = parent.get("id").is_some() && parent.get("id") == self.image.get("id");
        match (is_image, self.image.get("links")) {
            (true, Some(Value::Object(links))) => Ok(links
                .get(link_type)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            _ => self.fallback.linked(parent, link_type),
        }
    }
}

/// Evaluate `query`'s predicate against one contract. Returns the result row
/// the statement would produce for it, or `None` when it does not match.
pub fn evaluate_row(query: &SqlQuery, contract: &Value, resolver: &dyn LinkResolver) -> Result<Option<Row>> {
    let Some(matches) = query.filter.matches(&query.tables.contracts, contract, resolver)? else {
        return Ok(None);
    };
    Ok(Some(build_row(query, contract, &matches)))
}

/// Evaluate and reshape: the contract as `query` would return it.
pub fn evaluate(query: &SqlQuery, contract: &Value, resolver: &dyn LinkResolver) -> Result<Option<Value>> {
    Ok(evaluate_row(query, contract, resolver)?
        .and_then(|row| query.reshape(vec![row]).pop()))
}

/// The row the statement yields for `contract`, given the linked contracts
/// each join found.
pub fn build_row(query: &SqlQuery, contract: &Value, matches: &LinkMatches) -> Row {
    let mut row = Map::new();
    row.insert(
        ID_COLUMN.to_string(),
        contract.get("id").cloned().unwrap_or(Value::Null),
    );
    row.insert(CONTRACT_COLUMN.to_string(), query.select.project(contract));
    for variant in query.variants() {
        let select = query.variant_select(variant);
        let entries: Vec<Value> = matches
            .get(&variant.join_alias)
            .iter()
            .map(|m| {
                serde_json::json!({
                    "parent": m.parent,
                    "id": m.contract.get("id").cloned().unwrap_or(Value::Null),
                    "contract": select.project(&m.contract),
                })
            })
            .collect();
        row.insert(variant.join_alias.clone(), Value::Array(entries));
    }
    Value::Object(row)
}

/// Order full contracts the way the statement's `ORDER BY` does.
pub fn sort_contracts(query: &SqlQuery, contracts: &mut [Value]) {
    let options = &query.options;
    let id = |c: &Value| c.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    match options.sort_by.as_ref().filter(|p| !p.is_empty()) {
        None => contracts.sort_by(|a, b| {
            let created = |c: &Value| c.get("created_at").and_then(Value::as_str).map(str::to_string);
            created(a).cmp(&created(b)).then_with(|| id(a).cmp(&id(b)))
        }),
        Some(path) => {
            let by_version = path.len() == 1 && path[0] == "version";
            let sort_path = path
                .iter()
                .fold(ValuePath::row(&query.tables.contracts), |p, key| p.child(key));
            contracts.sort_by(|a, b| {
                let ordering = if by_version {
                    let version = |c: &Value| {
                        c.get("version")
                            .and_then(Value::as_str)
                            .and_then(|v| Version::parse(v).ok())
                    };
                    nulls_last(version(a), version(b), options.sort_dir)
                } else {
                    nulls_last(
                        sort_path.resolve(a).filter(|v| !v.is_null()),
                        sort_path.resolve(b).filter(|v| !v.is_null()),
                        options.sort_dir,
                    )
                };
                ordering.then_with(|| id(a).cmp(&id(b)))
            });
        }
    }
}

/// `NULL`s sort last ascending and first descending, as in PostgreSQL.
fn nulls_last<T: JsonOrd>(a: Option<T>, b: Option<T>, dir: SortDir) -> Ordering {
    let ordering = match (&a, &b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.json_cmp(y),
    };
    match dir {
        SortDir::Asc => ordering,
        SortDir::Desc => ordering.reverse(),
    }
}

trait JsonOrd {
    fn json_cmp(&self, other: &Self) -> Ordering;
}

impl JsonOrd for Version {
    fn json_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl JsonOrd for &Value {
    fn json_cmp(&self, other: &Self) -> Ordering {
        compare_json(self, other)
    }
}

/// `jsonb` ordering: object > array > boolean > number > string > null.
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => xs
            .len()
            .cmp(&ys.len())
            .then_with(|| {
                xs.iter()
                    .zip(ys)
                    .map(|(x, y)| compare_json(x, y))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            }),
        (Value::Object(xs), Value::Object(ys)) => xs.len().cmp(&ys.len()).then_with(|| {
            xs.iter()
                .zip(ys.iter())
                .map(|((kx, vx), (ky, vy))| kx.cmp(ky).then_with(|| compare_json(vx, vy)))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        _ => rank(a).cmp(&rank(b)),
    }
}
