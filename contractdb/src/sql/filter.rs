use super::context::links_alias;
use super::path::{quote_ident, quote_literal, ValuePath};
use super::query::Tables;
use crate::error::Result;
use crate::schema::JsonType;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A compiled predicate. Renders to a PostgreSQL boolean expression and can
/// be evaluated directly against contracts.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlFilter {
    True,
    False,
    And(Vec<SqlFilter>),
    Or(Vec<SqlFilter>),
    Not(Box<SqlFilter>),
    /// The path resolves to a value (`IS NOT NULL`).
    Present(ValuePath),
    TypeIs(ValuePath, Vec<JsonType>),
    Equals(ValuePath, Value),
    OneOf(ValuePath, Vec<Value>),
    Matches {
        path: ValuePath,
        pattern: Pattern,
    },
    /// Numeric comparison; false for non-numbers.
    Compare {
        path: ValuePath,
        op: CompareOp,
        value: f64,
    },
    /// Character length of a string.
    Length {
        path: ValuePath,
        op: CompareOp,
        value: u64,
    },
    /// Number of items of an array; false for non-arrays.
    ItemCount {
        path: ValuePath,
        op: CompareOp,
        value: u64,
    },
    FullText {
        path: ValuePath,
        term: String,
    },
    /// Quantify `filter` over the members of the value at `path`, each bound
    /// as an element scope named `alias`.
    Each {
        path: ValuePath,
        source: EachSource,
        quantifier: Quantifier,
        alias: String,
        filter: Box<SqlFilter>,
    },
    /// At least one active contract is linked to the row `parent` through
    /// `link_type` and matches `filter`. Renders as an `EXISTS` subquery
    /// over the links and contracts tables, so that it holds or fails once
    /// per parent row however many contracts the output joins return.
    Link {
        parent: String,
        link_type: String,
        alias: String,
        filter: Box<SqlFilter>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EachSource {
    /// Items of an array.
    Elements,
    /// Values of an object whose keys are not listed.
    ExtraValues(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    All,
    Any,
}

/// A regular expression, compiled once and kept with the source it renders
/// as.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: regex::Regex,
    case_insensitive: bool,
}

impl Pattern {
    pub fn new(source: &str, case_insensitive: bool) -> Result<Self> {
        let regex = regex::RegexBuilder::new(source)
            .case_insensitive(case_insensitive)
            .build()?;
        Ok(Pattern {
            regex,
            case_insensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str() && self.case_insensitive == other.case_insensitive
    }
}

/// Positional parameters collected while rendering, and the tables `$$links`
/// subqueries read.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<Value>,
    tables: Tables,
}

impl Params {
    pub fn new(tables: &Tables) -> Self {
        Params {
            values: Vec::new(),
            tables: tables.clone(),
        }
    }

    pub fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

// ── Rendering ───────────────────────────────────────────────────────

impl SqlFilter {
    /// Conjunction that drops trivially true members.
    pub fn and(filters: Vec<SqlFilter>) -> SqlFilter {
        let mut filters: Vec<SqlFilter> = filters
            .into_iter()
            .filter(|f| *f != SqlFilter::True)
            .collect();
        match filters.len() {
            0 => SqlFilter::True,
            1 => filters.remove(0),
            _ => SqlFilter::And(filters),
        }
    }

    pub fn to_sql(&self, params: &mut Params) -> String {
        match self {
            SqlFilter::True => "true".to_string(),
            SqlFilter::False => "false".to_string(),
            SqlFilter::And(filters) => join(filters, " AND ", "true", params),
            SqlFilter::Or(filters) => join(filters, " OR ", "false", params),
            SqlFilter::Not(filter) => format!("NOT ({})", filter.to_sql(params)),
            SqlFilter::Present(path) => format!("({} IS NOT NULL)", path.to_sql()),
            SqlFilter::TypeIs(path, types) => {
                let expr = path.to_sql();
                let tests: Vec<String> = types
                    .iter()
                    .map(|t| match t {
                        JsonType::Integer => format!(
                            "(CASE WHEN jsonb_typeof({expr}) = 'number' THEN ({expr})::numeric % 1 = 0 ELSE false END)"
                        ),
                        other => format!("jsonb_typeof({expr}) = '{}'", other.sql_name()),
                    })
                    .collect();
                match tests.len() {
                    0 => "false".to_string(),
                    1 => format!("({})", tests[0]),
                    _ => format!("({})", tests.join(" OR ")),
                }
            }
            SqlFilter::Equals(path, value) => {
                format!("({} = {}::jsonb)", path.to_sql(), params.bind(value.clone()))
            }
            SqlFilter::OneOf(path, values) => {
                if values.is_empty() {
                    return "false".to_string();
                }
                let bound: Vec<String> = values
                    .iter()
                    .map(|v| format!("{}::jsonb", params.bind(v.clone())))
                    .collect();
                format!("({} IN ({}))", path.to_sql(), bound.join(", "))
            }
            SqlFilter::Matches { path, pattern } => {
                let op = if pattern.case_insensitive() { "~*" } else { "~" };
                format!(
                    "({} {op} {}::text)",
                    path.to_text_sql(),
                    params.bind(Value::String(pattern.as_str().to_string()))
                )
            }
            SqlFilter::Compare { path, op, value } => {
                let expr = path.to_sql();
                format!(
                    "(CASE WHEN jsonb_typeof({expr}) = 'number' THEN ({expr})::numeric {} {}::numeric ELSE false END)",
                    op.sql(),
                    params.bind(Value::from(*value))
                )
            }
            SqlFilter::Length { path, op, value } => format!(
                "(char_length{} {} {}::integer)",
                path.to_text_sql(),
                op.sql(),
                params.bind(Value::from(*value))
            ),
            SqlFilter::ItemCount { path, op, value } => {
                let expr = path.to_sql();
                format!(
                    "(CASE WHEN jsonb_typeof({expr}) = 'array' THEN jsonb_array_length({expr}) {} {}::integer ELSE false END)",
                    op.sql(),
                    params.bind(Value::from(*value))
                )
            }
            SqlFilter::FullText { path, term } => format!(
                "(to_tsvector('english', {}) @@ to_tsquery('english', {}::text))",
                path.to_text_sql(),
                params.bind(Value::String(ts_query(term)))
            ),
            SqlFilter::Each {
                path,
                source,
                quantifier,
                alias,
                filter,
            } => {
                let expr = path.to_sql();
                let alias_ident = quote_ident(alias);
                let (kind, from, key_filter) = match source {
                    EachSource::Elements => (
                        "array",
                        format!("jsonb_array_elements({expr}) AS {alias_ident}(\"value\")"),
                        String::new(),
                    ),
                    EachSource::ExtraValues(known) => {
                        let key_filter = if known.is_empty() {
                            String::new()
                        } else {
                            let keys: Vec<String> =
                                known.iter().map(|k| quote_literal(k)).collect();
                            format!("{alias_ident}.\"key\" NOT IN ({}) AND ", keys.join(", "))
                        };
                        (
                            "object",
                            format!("jsonb_each({expr}) AS {alias_ident}(\"key\", \"value\")"),
                            key_filter,
                        )
                    }
                };
                let inner = filter.to_sql(params);
                let (exists, condition, otherwise) = match quantifier {
                    Quantifier::All => ("NOT EXISTS", format!("NOT ({inner})"), "true"),
                    Quantifier::Any => ("EXISTS", inner, "false"),
                };
                format!(
                    "(CASE WHEN jsonb_typeof({expr}) = '{kind}' THEN {exists} (SELECT 1 FROM {from} WHERE {key_filter}{condition}) ELSE {otherwise} END)"
                )
            }
            SqlFilter::Link {
                parent,
                link_type,
                alias,
                filter,
            } => {
                let links = quote_ident(&links_alias(alias));
                let joined = quote_ident(alias);
                let parent = quote_ident(parent);
                let from = format!(
                    "{} AS {links} JOIN {} AS {joined} ON {}",
                    quote_ident(&params.tables.links),
                    quote_ident(&params.tables.contracts),
                    linked_id(&links, &parent, &joined)
                );
                let attached = link_condition(&links, &parent, &quote_literal(link_type));
                let inner = filter.to_sql(params);
                format!("EXISTS (SELECT 1 FROM {from} WHERE {attached} AND {joined}.\"active\" AND {inner})")
            }
        }
    }
}

/// Rows of the links table `links` that attach to `parent` as `name`, from
/// either end.
pub(crate) fn link_condition(links: &str, parent: &str, name: &str) -> String {
    format!(
        "(({links}.\"from_id\" = {parent}.\"id\" AND {links}.\"name\" = {name}) \
         OR ({links}.\"to_id\" = {parent}.\"id\" AND {links}.\"inverse_name\" = {name}))"
    )
}

/// `joined` is the contract at the far end of the links row.
pub(crate) fn linked_id(links: &str, parent: &str, joined: &str) -> String {
    format!(
        "{joined}.\"id\" = CASE WHEN {links}.\"from_id\" = {parent}.\"id\" \
         THEN {links}.\"to_id\" ELSE {links}.\"from_id\" END"
    )
}

fn join(filters: &[SqlFilter], separator: &str, empty: &str, params: &mut Params) -> String {
    if filters.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = filters.iter().map(|f| f.to_sql(params)).collect();
    format!("({})", parts.join(separator))
}

/// `"some words"` becomes `some & words`.
pub fn ts_query(term: &str) -> String {
    words(term).collect::<Vec<_>>().join(" & ")
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Contracts linked to another contract, as needed to evaluate `$$links`.
pub trait LinkResolver {
    /// Contracts linked to `parent` (the full row bound to the parent
    /// scope) through `link_type`.
    fn linked(&self, parent: &Value, link_type: &str) -> Result<Vec<Value>>;
}

/// One linked contract that satisfied a link filter.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkMatch {
    pub parent: String,
    pub contract: Value,
}

/// Linked contracts found while evaluating, keyed by join alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkMatches {
    by_alias: BTreeMap<String, Vec<LinkMatch>>,
}

impl LinkMatches {
    pub fn record(&mut self, alias: &str, parent: &str, contract: Value) {
        let entries = self.by_alias.entry(alias.to_string()).or_default();
        let id = contract.get("id");
        if entries
            .iter()
            .any(|e| e.parent == parent && e.contract.get("id") == id)
        {
            return;
        }
        entries.push(LinkMatch {
            parent: parent.to_string(),
            contract,
        });
    }

    pub fn extend(&mut self, other: LinkMatches) {
        for (alias, entries) in other.by_alias {
            for entry in entries {
                self.record(&alias, &entry.parent, entry.contract);
            }
        }
    }

    pub fn get(&self, alias: &str) -> &[LinkMatch] {
        self.by_alias.get(alias).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Values bound to scope aliases during evaluation.
#[derive(Debug, Default)]
pub struct Bindings {
    stack: Vec<(String, Value)>,
}

impl Bindings {
    pub fn new(alias: &str, value: Value) -> Self {
        Bindings {
            stack: vec![(alias.to_string(), value)],
        }
    }

    fn get(&self, alias: &str) -> Option<&Value> {
        self.stack
            .iter()
            .rev()
            .find(|(name, _)| name == alias)
            .map(|(_, value)| value)
    }

    fn resolve(&self, path: &ValuePath) -> Option<&Value> {
        path.resolve(self.get(path.scope.alias())?)
    }

    fn push(&mut self, alias: &str, value: Value) {
        self.stack.push((alias.to_string(), value));
    }

    fn pop(&mut self) {
        self.stack.pop();
    }
}

impl SqlFilter {
    /// Evaluate against the values in `bindings`. Every branch is visited so
    /// that `matches` collects all linked contracts the SQL join would
    /// return; matches found under `NOT` are discarded.
    pub fn eval(
        &self,
        bindings: &mut Bindings,
        resolver: &dyn LinkResolver,
        matches: &mut LinkMatches,
    ) -> Result<bool> {
        Ok(match self {
            SqlFilter::True => true,
            SqlFilter::False => false,
            SqlFilter::And(filters) => {
                let mut result = true;
                for filter in filters {
                    result &= filter.eval(bindings, resolver, matches)?;
                }
                result
            }
            SqlFilter::Or(filters) => {
                let mut result = false;
                for filter in filters {
                    result |= filter.eval(bindings, resolver, matches)?;
                }
                result
            }
            SqlFilter::Not(filter) => {
                let mut discarded = LinkMatches::default();
                !filter.eval(bindings, resolver, &mut discarded)?
            }
            SqlFilter::Present(path) => bindings.resolve(path).is_some(),
            SqlFilter::TypeIs(path, types) => match bindings.resolve(path) {
                Some(value) => types.iter().any(|t| t.matches(value)),
                None => false,
            },
            SqlFilter::Equals(path, expected) => match bindings.resolve(path) {
                Some(value) => json_equal(value, expected),
                None => false,
            },
            SqlFilter::OneOf(path, values) => match bindings.resolve(path) {
                Some(value) => values.iter().any(|v| json_equal(value, v)),
                None => false,
            },
            SqlFilter::Matches { path, pattern } => match bindings.resolve(path) {
                Some(value) => pattern.is_match(&text_of(value)),
                None => false,
            },
            SqlFilter::Compare { path, op, value } => {
                match bindings.resolve(path).and_then(Value::as_f64) {
                    Some(n) => n.partial_cmp(value).map(|o| op.holds(o)).unwrap_or(false),
                    None => false,
                }
            }
            SqlFilter::Length { path, op, value } => match bindings.resolve(path) {
                Some(v) => op.holds((text_of(v).chars().count() as u64).cmp(value)),
                None => false,
            },
            SqlFilter::ItemCount { path, op, value } => {
                match bindings.resolve(path).and_then(Value::as_array) {
                    Some(items) => op.holds((items.len() as u64).cmp(value)),
                    None => false,
                }
            }
            SqlFilter::FullText { path, term } => match bindings.resolve(path) {
                Some(value) => full_text_match(&text_of(value), term),
                None => false,
            },
            SqlFilter::Each {
                path,
                source,
                quantifier,
                alias,
                filter,
            } => {
                let members: Option<Vec<Value>> = match (source, bindings.resolve(path)) {
                    (EachSource::Elements, Some(Value::Array(items))) => Some(items.clone()),
                    (EachSource::ExtraValues(known), Some(Value::Object(map))) => Some(
                        map.iter()
                            .filter(|(k, _)| !known.contains(k))
                            .map(|(_, v)| v.clone())
                            .collect(),
                    ),
                    _ => None,
                };
                let Some(members) = members else {
                    return Ok(*quantifier == Quantifier::All);
                };
                let mut holds = Vec::with_capacity(members.len());
                for member in members {
                    bindings.push(alias, member);
                    let result = filter.eval(bindings, resolver, matches);
                    bindings.pop();
                    holds.push(result?);
                }
                match quantifier {
                    Quantifier::All => holds.iter().all(|h| *h),
                    Quantifier::Any => holds.iter().any(|h| *h),
                }
            }
            SqlFilter::Link {
                parent,
                link_type,
                alias,
                filter,
            } => {
                let Some(parent_row) = bindings.get(parent).cloned() else {
                    return Ok(false);
                };
                let parent_id = parent_row
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut found = false;
                for candidate in resolver.linked(&parent_row, link_type)? {
                    if candidate.get("active") == Some(&Value::Bool(false)) {
                        continue;
                    }
                    let mut nested = LinkMatches::default();
                    bindings.push(alias, candidate.clone());
                    let result = filter.eval(bindings, resolver, &mut nested);
                    bindings.pop();
                    if result? {
                        found = true;
                        matches.record(alias, &parent_id, candidate);
                        matches.extend(nested);
                    }
                }
                found
            }
        })
    }

    /// Evaluate against a single contract bound to `scope`.
    pub fn matches(
        &self,
        scope: &str,
        contract: &Value,
        resolver: &dyn LinkResolver,
    ) -> Result<Option<LinkMatches>> {
        let mut bindings = Bindings::new(scope, contract.clone());
        let mut matches = LinkMatches::default();
        if self.eval(&mut bindings, resolver, &mut matches)? {
            Ok(Some(matches))
        } else {
            Ok(None)
        }
    }

    /// Every join alias referenced by a `Link` node, in visiting order.
    pub fn link_aliases(&self) -> Vec<&str> {
        let mut aliases = Vec::new();
        self.collect_aliases(&mut aliases);
        aliases
    }

    fn collect_aliases<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            SqlFilter::And(filters) | SqlFilter::Or(filters) => {
                filters.iter().for_each(|f| f.collect_aliases(out))
            }
            SqlFilter::Not(filter) | SqlFilter::Each { filter, .. } => filter.collect_aliases(out),
            SqlFilter::Link { alias, filter, .. } => {
                out.push(alias);
                filter.collect_aliases(out);
            }
            _ => {}
        }
    }
}

/// JSON equality with numbers compared by value, as `jsonb` does.
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => objects_equal(xs, ys),
        _ => a == b,
    }
}

fn objects_equal(xs: &Map<String, Value>, ys: &Map<String, Value>) -> bool {
    xs.len() == ys.len()
        && xs
            .iter()
            .all(|(k, x)| ys.get(k).map(|y| json_equal(x, y)).unwrap_or(false))
}

/// The text `#>> '{}'` yields for a value.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn full_text_match(text: &str, term: &str) -> bool {
    let wanted: Vec<String> = words(term).map(stem).collect();
    if wanted.is_empty() {
        return false;
    }
    let present: Vec<String> = words(text).map(stem).collect();
    wanted.iter().all(|w| present.contains(w))
}

/// Lower-case and strip common English suffixes.
fn stem(word: &str) -> String {
    let word = word.to_lowercase();
    for suffix in ["ing", "ed", "es", "ly", "s"] {
        if let Some(root) = word.strip_suffix(suffix) {
            if root.chars().count() >= 3 {
                return root.to_string();
            }
        }
    }
    word
}
