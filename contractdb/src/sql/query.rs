use super::context::{LinkNode, Variant};
use super::filter::{link_condition, linked_id, Params, SqlFilter};
use super::path::{quote_ident, quote_literal, ValuePath};
use crate::error::{ContractDbError, Result};
use crate::select::SelectMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Output column holding the projected contract.
pub const CONTRACT_COLUMN: &str = "contract";
/// Output column holding the root contract's id.
pub const ID_COLUMN: &str = "id";

/// Table names the statement refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tables {
    pub contracts: String,
    pub links: String,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            contracts: "cards".to_string(),
            links: "links".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    fn sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// Paging and ordering of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    /// Property path to sort by, e.g. `["data", "timestamp"]`.
    pub sort_by: Option<Vec<String>>,
    pub sort_dir: SortDir,
}

/// A compiled statement: its text and parameters, plus what it was compiled
/// from so that rows can be reshaped and the predicate re-evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub text: String,
    pub params: Vec<Value>,
    pub tables: Tables,
    pub select: SelectMap,
    /// The root predicate. `Link` nodes carry their full filters.
    pub filter: SqlFilter,
    pub links: BTreeMap<String, LinkNode>,
    pub options: QueryOptions,
}

impl SqlQuery {
    /// Assemble the statement.
    pub fn assemble(
        tables: &Tables,
        select: &SelectMap,
        filter: SqlFilter,
        links: BTreeMap<String, LinkNode>,
        options: &QueryOptions,
    ) -> Result<SqlQuery> {
        if options.limit == Some(0) {
            return Err(ContractDbError::InvalidLimit("Query limit must be a positive integer".into()));
        }

        let root = quote_ident(&tables.contracts);
        let mut params = Params::new(tables);

        let mut columns = vec![
            format!("{root}.\"id\" AS {}", quote_ident(ID_COLUMN)),
            format!(
                "{} AS {}",
                projection(&format!("to_jsonb({root})"), select, 0),
                quote_ident(CONTRACT_COLUMN)
            ),
        ];
        let mut joins = Vec::new();
        for (link_type, node) in &links {
            let link_select = select.links.get(link_type);
            render_node(tables, node, link_select, &mut columns, &mut joins, &mut params);
        }

        let mut text = format!("SELECT {}\nFROM {root}", columns.join(",\n  "));
        for join in &joins {
            text.push('\n');
            text.push_str(join);
        }

        // Joins only feed the output columns. The predicate checks links with
        // its own subqueries, once per root row.
        text.push_str(&format!("\nWHERE {}", filter.to_sql(&mut params)));

        if !joins.is_empty() {
            text.push_str(&format!("\nGROUP BY {root}.\"id\""));
        }

        text.push_str(&format!("\nORDER BY {}", order_by(&tables.contracts, options)));
        if let Some(limit) = options.limit {
            text.push_str(&format!("\nLIMIT {limit}"));
        }
        if let Some(skip) = options.skip.filter(|s| *s > 0) {
            text.push_str(&format!("\nOFFSET {skip}"));
        }

        Ok(SqlQuery {
            text,
            params: params.into_values(),
            tables: tables.clone(),
            select: select.clone(),
            filter,
            links,
            options: options.clone(),
        })
    }

    /// Every variant, parents before their nested variants.
    pub fn variants(&self) -> Vec<&Variant> {
        let mut out = Vec::new();
        collect_variants(&self.links, &mut out);
        out
    }

    /// The selection applying to the contracts joined by `variant`.
    pub fn variant_select(&self, variant: &Variant) -> SelectMap {
        find_select(&self.links, &self.select, &variant.join_alias).unwrap_or_default()
    }

    /// Turn result rows into contracts, attaching linked contracts under
    /// `links` for every selected link type.
    pub fn reshape(&self, rows: Vec<Value>) -> Vec<Value> {
        rows.into_iter()
            .map(|row| {
                let mut contract = row.get(CONTRACT_COLUMN).cloned().unwrap_or(Value::Null);
                if !self.select.links.is_empty() {
                    let id = row.get(ID_COLUMN).and_then(Value::as_str).unwrap_or_default();
                    let links = attach_links(&self.links, &self.select.links, &row, id);
                    if let Value::Object(object) = &mut contract {
                        object.insert("links".to_string(), Value::Object(links));
                    }
                }
                contract
            })
            .collect()
    }
}

fn collect_variants<'a>(links: &'a BTreeMap<String, LinkNode>, out: &mut Vec<&'a Variant>) {
    for node in links.values() {
        for variant in &node.variants {
            out.push(variant);
            collect_variants(&variant.nested, out);
        }
    }
}

fn find_select(
    links: &BTreeMap<String, LinkNode>,
    select: &SelectMap,
    alias: &str,
) -> Option<SelectMap> {
    for (link_type, node) in links {
        let link_select = select.links.get(link_type).cloned().unwrap_or_default();
        for variant in &node.variants {
            if variant.join_alias == alias {
                return Some(link_select);
            }
            if let Some(found) = find_select(&variant.nested, &link_select, alias) {
                return Some(found);
            }
        }
    }
    None
}

/// Emit the joins and the output column of every variant in `node`, then of
/// their nested variants.
fn render_node(
    tables: &Tables,
    node: &LinkNode,
    select: Option<&SelectMap>,
    columns: &mut Vec<String>,
    joins: &mut Vec<String>,
    params: &mut Params,
) {
    let empty = SelectMap::default();
    let select = select.unwrap_or(&empty);
    for variant in &node.variants {
        let parent = quote_ident(&variant.parent);
        let links = variant.links_ident();
        let joined = variant.join_ident();
        let name = variant.link_name();

        joins.push(format!(
            "LEFT JOIN {} AS {links} ON {}",
            quote_ident(&tables.links),
            link_condition(&links, &parent, &name)
        ));
        joins.push(format!(
            "LEFT JOIN {} AS {joined} ON {} AND {joined}.\"active\" AND {}",
            quote_ident(&tables.contracts),
            linked_id(&links, &parent, &joined),
            variant.join_filter().to_sql(params)
        ));

        // A hoisted filter names joins made later, so it can only be applied
        // once every row is joined.
        let mut present = format!("{joined}.\"id\" IS NOT NULL");
        if variant.hoisted {
            present.push_str(&format!(" AND {}", variant.filter.to_sql(params)));
        }
        columns.push(format!(
            "coalesce(jsonb_agg(DISTINCT jsonb_build_object('parent', {parent}.\"id\", 'id', {joined}.\"id\", 'contract', {})) \
             FILTER (WHERE {present}), '[]'::jsonb) AS {joined}",
            projection(&format!("to_jsonb({joined})"), select, 0)
        ));

        for (link_type, nested) in &variant.nested {
            render_node(tables, nested, select.links.get(link_type), columns, joins, params);
        }
    }
}

/// `jsonb` expression keeping only the selected parts of `expr`. Keys the
/// value lacks are left out, never emitted as `null`.
fn projection(expr: &str, select: &SelectMap, depth: usize) -> String {
    if select.properties.is_empty() {
        return expr.to_string();
    }
    let alias = quote_ident(&format!("p{depth}"));
    let keys: Vec<String> = select.properties.keys().map(|k| quote_literal(k)).collect();
    let nested: Vec<String> = select
        .properties
        .iter()
        .filter(|(_, sub)| !sub.properties.is_empty())
        .map(|(key, sub)| {
            format!(
                "WHEN {} THEN {}",
                quote_literal(key),
                projection(&format!("{alias}.\"value\""), sub, depth + 1)
            )
        })
        .collect();
    let value = if nested.is_empty() {
        format!("{alias}.\"value\"")
    } else {
        format!("CASE {alias}.\"key\" {} ELSE {alias}.\"value\" END", nested.join(" "))
    };
    format!(
        "(CASE WHEN jsonb_typeof({expr}) = 'object' THEN (SELECT coalesce(jsonb_object_agg({alias}.\"key\", {value}), '{{}}'::jsonb) \
         FROM jsonb_each({expr}) AS {alias}(\"key\", \"value\") WHERE {alias}.\"key\" IN ({})) ELSE {expr} END)",
        keys.join(", ")
    )
}

fn order_by(table: &str, options: &QueryOptions) -> String {
    let root = quote_ident(table);
    let default = format!("{root}.\"created_at\" ASC, {root}.\"id\" ASC");
    let Some(path) = options.sort_by.as_ref().filter(|p| !p.is_empty()) else {
        return default;
    };
    let dir = options.sort_dir.sql();
    let expr = if path.len() == 1 && path[0] == "version" {
        format!(
            "string_to_array(split_part(split_part({root}.\"version\", '+', 1), '-', 1), '.')::int[]"
        )
    } else {
        path.iter()
            .fold(ValuePath::row(table), |sort_path, key| sort_path.child(key))
            .to_sql()
    };
    format!("{expr} {dir}, {root}.\"id\" ASC")
}

/// Build the `links` object for the contract `parent_id` out of the variant
/// columns of `row`.
fn attach_links(
    links: &BTreeMap<String, LinkNode>,
    selected: &BTreeMap<String, SelectMap>,
    row: &Value,
    parent_id: &str,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (link_type, select) in selected {
        let mut contracts = Vec::new();
        let mut seen = HashSet::new();
        if let Some(node) = links.get(link_type) {
            for variant in &node.variants {
                let entries = row
                    .get(&variant.join_alias)
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                for entry in entries {
                    if entry.get("parent").and_then(Value::as_str) != Some(parent_id) {
                        continue;
                    }
                    let Some(id) = entry.get("id").and_then(Value::as_str) else {
                        continue;
                    };
                    if !seen.insert(id.to_string()) {
                        continue;
                    }
                    let mut contract = entry.get("contract").cloned().unwrap_or(Value::Null);
                    if !select.links.is_empty() {
                        let nested = attach_links(&variant.nested, &select.links, row, id);
                        if let Value::Object(object) = &mut contract {
                            object.insert("links".to_string(), Value::Object(nested));
                        }
                    }
                    contracts.push(contract);
                }
            }
        }
        out.insert(link_type.clone(), Value::Array(contracts));
    }
    out
}
