use super::filter::SqlFilter;
use super::path::{quote_ident, quote_literal};
use crate::error::Result;
use crate::schema::Schema;
use std::collections::BTreeMap;

/// Compiles one schema node against a shared context. Handed to the context
/// when it is created, since link filters are compiled from inside it.
pub type FragmentCompiler = fn(&mut BuilderContext, &Schema) -> Result<SqlFilter>;

/// All the joins made for one link type at one nesting position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkNode {
    pub variants: Vec<Variant>,
}

/// One occurrence of a link type: a pair of joins (links table, then
/// contracts table) under aliases derived from the traversal path.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub link_type: String,
    /// Alias of the scope the link starts from.
    pub parent: String,
    /// Unquoted alias of the joined contracts table.
    pub join_alias: String,
    /// Unquoted alias of the joined links table.
    pub links_alias: String,
    /// Filter on the linked contract.
    pub filter: SqlFilter,
    /// The filter refers to joins made after this one, so it cannot sit in
    /// this variant's join condition.
    pub hoisted: bool,
    /// Links added while compiling this variant's filter.
    pub nested: BTreeMap<String, LinkNode>,
}

impl Variant {
    /// The link type as an SQL literal.
    pub fn link_name(&self) -> String {
        quote_literal(&self.link_type)
    }

    pub fn join_ident(&self) -> String {
        quote_ident(&self.join_alias)
    }

    pub fn links_ident(&self) -> String {
        quote_ident(&self.links_alias)
    }

    /// What the join condition on the linked contract holds: the filter,
    /// unless it was hoisted.
    pub fn join_filter(&self) -> SqlFilter {
        if self.hoisted {
            SqlFilter::True
        } else {
            self.filter.clone()
        }
    }
}

/// Alias of the links table joined alongside the contracts alias
/// `join_alias`.
pub fn links_alias(join_alias: &str) -> String {
    match join_alias.strip_prefix("join@") {
        Some(path) => format!("links@{path}"),
        None => format!("links@{join_alias}"),
    }
}

/// State shared by every fragment compiled for one statement: the table
/// scope, the path of links traversed to get there, every join discovered so
/// far, and the filters that had to move out of join conditions.
pub struct BuilderContext {
    table_stack: Vec<String>,
    link_type_stack: Vec<(String, usize)>,
    links: BTreeMap<String, LinkNode>,
    link_count: usize,
    hoisted_filters: Vec<SqlFilter>,
    element_count: usize,
    compile_fragment: FragmentCompiler,
}

impl BuilderContext {
    pub fn new(table: &str, compile_fragment: FragmentCompiler) -> Self {
        BuilderContext {
            table_stack: vec![table.to_string()],
            link_type_stack: Vec::new(),
            links: BTreeMap::new(),
            link_count: 0,
            hoisted_filters: Vec::new(),
            element_count: 0,
            compile_fragment,
        }
    }

    /// The table (or alias) fragments currently refer to.
    pub fn current_scope(&self) -> &str {
        self.table_stack
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn push_scope(&mut self, table: &str) {
        self.table_stack.push(table.to_string());
    }

    pub fn pop_scope(&mut self) {
        // The root table is never popped
        if self.table_stack.len() > 1 {
            self.table_stack.pop();
        }
    }

    /// Run `f` with `table` as the current scope, popping it again whatever
    /// `f` returns.
    pub fn with_scope<T>(
        &mut self,
        table: &str,
        f: impl FnOnce(&mut BuilderContext) -> Result<T>,
    ) -> Result<T> {
        self.push_scope(table);
        let result = f(self);
        self.pop_scope();
        result
    }

    /// A fresh alias for `jsonb_array_elements` / `jsonb_each` subqueries.
    pub fn next_element_alias(&mut self) -> String {
        let alias = format!("el{}", self.element_count);
        self.element_count += 1;
        alias
    }

    pub fn link_count(&self) -> usize {
        self.link_count
    }

    /// Register a join through `link_type` from the current scope and
    /// compile `schema` against the joined contract. Returns the join alias
    /// and the compiled filter.
    ///
    /// When compiling the filter added further links, the filter refers to
    /// joins that come after this one, so it is hoisted: the join condition
    /// becomes `true` and the filter is checked by the `Link` node and the
    /// variant's output column instead.
    pub fn add_link(&mut self, link_type: &str, schema: &Schema) -> Result<(String, SqlFilter)> {
        let parent = self.current_scope().to_string();
        let stack = self.link_type_stack.clone();
        let index = variants_at(&mut self.links, &stack, link_type).len();
        self.link_type_stack.push((link_type.to_string(), index));

        let path = self
            .link_type_stack
            .iter()
            .map(|(t, i)| format!("{}.{i}", escape_link_type(t)))
            .collect::<Vec<_>>()
            .join("/");
        let join_alias = format!("join@/{path}");

        variants_at(&mut self.links, &stack, link_type).push(Variant {
            link_type: link_type.to_string(),
            parent,
            join_alias: join_alias.clone(),
            links_alias: links_alias(&join_alias),
            filter: SqlFilter::True,
            hoisted: false,
            nested: BTreeMap::new(),
        });

        let link_count_start = self.link_count;
        let compile = self.compile_fragment;
        let compiled = self.with_scope(&join_alias, |ctx| compile(ctx, schema));
        self.link_type_stack.pop();
        let filter = compiled?;

        let hoist = self.link_count > link_count_start;
        if hoist {
            self.hoisted_filters.push(filter.clone());
        }
        if let Some(variant) = variants_at(&mut self.links, &stack, link_type).get_mut(index) {
            variant.hoisted = hoist;
            variant.filter = filter.clone();
        }

        self.link_count += 1;
        Ok((join_alias, filter))
    }

    /// Every join registered so far.
    pub fn links(&self) -> &BTreeMap<String, LinkNode> {
        &self.links
    }

    /// Filters kept out of join conditions, ANDed. Each is still checked by
    /// the `Link` node that owns it.
    pub fn hoisted_filters(&self) -> SqlFilter {
        SqlFilter::and(self.hoisted_filters.clone())
    }

    pub fn into_links(self) -> BTreeMap<String, LinkNode> {
        self.links
    }
}

/// The variants of `link_type` below the traversal path `stack`, creating
/// the intermediate nodes as needed. Every stack entry was pushed right
/// after its variant was registered, so the indices exist.
fn variants_at<'a>(
    links: &'a mut BTreeMap<String, LinkNode>,
    stack: &[(String, usize)],
    link_type: &str,
) -> &'a mut Vec<Variant> {
    let mut level = links;
    for (stack_type, stack_index) in stack {
        let node = level.entry(stack_type.clone()).or_default();
        level = &mut node.variants[*stack_index].nested;
    }
    &mut level.entry(link_type.to_string()).or_default().variants
}

/// Link types may contain the characters used to build alias paths.
fn escape_link_type(link_type: &str) -> String {
    link_type.replace('\\', "\\\\").replace('/', "\\/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::filter::Params;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Compiles `$$links` only; everything else is `true`.
    fn links_only(ctx: &mut BuilderContext, schema: &Schema) -> Result<SqlFilter> {
        let mut filters = Vec::new();
        if let Some(links) = schema.as_object().and_then(|o| o.links.as_ref()) {
            for (link_type, nested) in links {
                let parent = ctx.current_scope().to_string();
                let (alias, filter) = ctx.add_link(link_type, nested)?;
                filters.push(SqlFilter::Link {
                    parent,
                    link_type: link_type.clone(),
                    alias,
                    filter: Box::new(filter),
                });
            }
        }
        if let Some(all_of) = schema.as_object().and_then(|o| o.all_of.as_ref()) {
            for branch in all_of {
                filters.push(links_only(ctx, branch)?);
            }
        }
        Ok(SqlFilter::and(filters))
    }

    fn failing(_ctx: &mut BuilderContext, _schema: &Schema) -> Result<SqlFilter> {
        Err(crate::ContractDbError::Compile("boom".into()))
    }

    fn schema(value: serde_json::Value) -> Schema {
        Schema::from_value(value).unwrap()
    }

    #[test]
    fn test_scopes() {
        let mut ctx = BuilderContext::new("cards", links_only);
        assert_eq!(ctx.current_scope(), "cards");
        ctx.push_scope("other");
        assert_eq!(ctx.current_scope(), "other");
        ctx.pop_scope();
        ctx.pop_scope();
        assert_eq!(ctx.current_scope(), "cards");
    }

    #[test]
    fn test_sibling_variants_get_consecutive_indices() {
        let mut ctx = BuilderContext::new("cards", links_only);
        let (first, _) = ctx.add_link("is attached to", &Schema::Bool(true)).unwrap();
        let (second, _) = ctx.add_link("is attached to", &Schema::Bool(true)).unwrap();
        assert_eq!(first, "join@/is attached to.0");
        assert_eq!(second, "join@/is attached to.1");

        let node = &ctx.links()["is attached to"];
        assert_eq!(node.variants.len(), 2);
        assert_eq!(node.variants[0].links_alias, "links@/is attached to.0");
        assert_eq!(node.variants[1].join_ident(), "\"join@/is attached to.1\"");
        assert_eq!(node.variants[0].link_name(), "'is attached to'");
        assert_eq!(node.variants[0].parent, "cards");
    }

    #[test]
    fn test_alias_is_a_function_of_the_path() {
        let nested = schema(json!({ "$$links": { "has member": true } }));

        let mut a = BuilderContext::new("cards", links_only);
        a.add_link("is member of", &nested).unwrap();
        let mut b = BuilderContext::new("cards", links_only);
        b.add_link("is member of", &nested).unwrap();

        let alias_a = &a.links()["is member of"].variants[0].nested["has member"].variants[0];
        let alias_b = &b.links()["is member of"].variants[0].nested["has member"].variants[0];
        assert_eq!(alias_a.join_alias, "join@/is member of.0/has member.0");
        assert_eq!(alias_a.join_alias, alias_b.join_alias);
        assert_eq!(alias_a.parent, "join@/is member of.0");
    }

    #[test]
    fn test_links_alias_mirrors_join_alias() {
        assert_eq!(links_alias("join@/has member.0"), "links@/has member.0");
        assert_eq!(links_alias("elsewhere"), "links@elsewhere");
    }

    #[test]
    fn test_separators_in_link_types_are_escaped() {
        let mut ctx = BuilderContext::new("cards", links_only);
        let (alias, _) = ctx.add_link("a/b.0", &Schema::Bool(true)).unwrap();
        assert_eq!(alias, "join@/a\\/b.0.0");
    }

    #[test]
    fn test_nested_links_are_hoisted() {
        let nested = schema(json!({ "$$links": { "has member": true } }));
        let mut ctx = BuilderContext::new("cards", links_only);
        let (_, filter) = ctx.add_link("is member of", &nested).unwrap();

        let outer = &ctx.links()["is member of"].variants[0];
        assert!(outer.hoisted);
        assert_eq!(outer.filter, filter);
        assert_eq!(outer.join_filter(), SqlFilter::True);

        let inner = &outer.nested["has member"].variants[0];
        assert!(!inner.hoisted);
        assert_eq!(inner.links_alias, "links@/is member of.0/has member.0");

        assert_eq!(ctx.hoisted_filters(), filter);
        let mut params = Params::default();
        let sql = ctx.hoisted_filters().to_sql(&mut params);
        assert!(sql.starts_with(
            "EXISTS (SELECT 1 FROM \"links\" AS \"links@/is member of.0/has member.0\" \
             JOIN \"cards\" AS \"join@/is member of.0/has member.0\""
        ));
        // The nested subquery hangs off the outer linked contract
        assert!(sql.contains("\"links@/is member of.0/has member.0\".\"from_id\" = \"join@/is member of.0\".\"id\""));
        assert_eq!(ctx.link_count(), 2);
    }

    #[test]
    fn test_plain_link_filter_stays_in_join() {
        let mut ctx = BuilderContext::new("cards", links_only);
        ctx.add_link("has member", &Schema::Bool(true)).unwrap();
        let variant = &ctx.links()["has member"].variants[0];
        assert!(!variant.hoisted);
        assert_eq!(variant.join_filter(), variant.filter);
        assert_eq!(ctx.hoisted_filters(), SqlFilter::True);
    }

    #[test]
    fn test_scope_restored_on_error() {
        let mut ctx = BuilderContext::new("cards", failing);
        assert!(ctx.add_link("has member", &Schema::Bool(true)).is_err());
        assert_eq!(ctx.current_scope(), "cards");

        // The path is unwound too: the next link sits at the root again
        ctx.compile_fragment = links_only;
        let (alias, _) = ctx.add_link("is member of", &Schema::Bool(true)).unwrap();
        assert_eq!(alias, "join@/is member of.0");
    }
}
