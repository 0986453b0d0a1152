use serde_json::Value;

/// Columns of the contracts table. Any other top-level property of a
/// contract reads as SQL `NULL`.
pub const ROW_COLUMNS: &[&str] = &[
    "id",
    "slug",
    "type",
    "version",
    "active",
    "name",
    "tags",
    "markers",
    "requires",
    "capabilities",
    "linked_at",
    "created_at",
    "updated_at",
    "data",
];

static NULL: Value = Value::Null;

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// What a path is rooted at.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// A row of the contracts table, under the given alias.
    Row(String),
    /// A value produced by `jsonb_array_elements` / `jsonb_each` under the
    /// given alias.
    Element(String),
}

impl Scope {
    pub fn alias(&self) -> &str {
        match self {
            Scope::Row(alias) | Scope::Element(alias) => alias,
        }
    }
}

/// A JSON value addressed from a scope through a sequence of object keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuePath {
    pub scope: Scope,
    pub keys: Vec<String>,
}

impl ValuePath {
    pub fn row(alias: &str) -> Self {
        ValuePath {
            scope: Scope::Row(alias.to_string()),
            keys: Vec::new(),
        }
    }

    pub fn element(alias: &str) -> Self {
        ValuePath {
            scope: Scope::Element(alias.to_string()),
            keys: Vec::new(),
        }
    }

    pub fn child(&self, key: &str) -> Self {
        let mut keys = self.keys.clone();
        keys.push(key.to_string());
        ValuePath {
            scope: self.scope.clone(),
            keys,
        }
    }

    /// True when this path is the row itself, where `$$links` can attach.
    pub fn is_row(&self) -> bool {
        matches!(self.scope, Scope::Row(_)) && self.keys.is_empty()
    }

    /// Render as a `jsonb` expression.
    pub fn to_sql(&self) -> String {
        match &self.scope {
            Scope::Row(alias) => {
                let alias = quote_ident(alias);
                let Some((column, rest)) = self.keys.split_first() else {
                    return format!("to_jsonb({alias})");
                };
                if !ROW_COLUMNS.contains(&column.as_str()) {
                    return "NULL::jsonb".to_string();
                }
                let column_ref = format!("{alias}.{}", quote_ident(column));
                if rest.is_empty() {
                    return format!("coalesce(to_jsonb({column_ref}), 'null'::jsonb)");
                }
                let base = if column == "data" {
                    column_ref
                } else {
                    format!("to_jsonb({column_ref})")
                };
                with_keys(base, rest)
            }
            Scope::Element(alias) => {
                with_keys(format!("{}.\"value\"", quote_ident(alias)), &self.keys)
            }
        }
    }

    /// Render as a `text` expression (the JSON value unwrapped).
    pub fn to_text_sql(&self) -> String {
        format!("({} #>> '{{}}')", self.to_sql())
    }

    /// Resolve against the value bound to this path's scope. Returns `None`
    /// where SQL would produce `NULL`.
    pub fn resolve<'a>(&self, bound: &'a Value) -> Option<&'a Value> {
        let mut keys = self.keys.iter();
        let mut current = bound;
        if let Scope::Row(_) = self.scope {
            if let Some(column) = keys.next() {
                if !ROW_COLUMNS.contains(&column.as_str()) {
                    return None;
                }
                current = bound.get(column.as_str()).unwrap_or(&NULL);
            }
        }
        for key in keys {
            current = current.as_object()?.get(key.as_str())?;
        }
        Some(current)
    }
}

fn with_keys(base: String, keys: &[String]) -> String {
    keys.iter().fold(base, |expr, key| {
        format!("{expr} -> {}", quote_literal(key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("join@/is attached to.0"), "\"join@/is attached to.0\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_row_paths() {
        let row = ValuePath::row("cards");
        assert_eq!(row.to_sql(), "to_jsonb(\"cards\")");
        assert_eq!(
            row.child("slug").to_sql(),
            "coalesce(to_jsonb(\"cards\".\"slug\"), 'null'::jsonb)"
        );
        assert_eq!(
            row.child("data").child("a").child("b").to_sql(),
            "\"cards\".\"data\" -> 'a' -> 'b'"
        );
        assert_eq!(
            row.child("linked_at").child("has member").to_sql(),
            "to_jsonb(\"cards\".\"linked_at\") -> 'has member'"
        );
        assert_eq!(row.child("foo").to_sql(), "NULL::jsonb");
    }

    #[test]
    fn test_element_paths() {
        let element = ValuePath::element("el0");
        assert_eq!(element.to_sql(), "\"el0\".\"value\"");
        assert_eq!(element.child("x").to_text_sql(), "(\"el0\".\"value\" -> 'x' #>> '{}')");
    }

    #[test]
    fn test_resolve_mirrors_sql() {
        let contract = json!({
            "slug": "foo",
            "name": null,
            "links": { "x": [] },
            "data": { "a": { "b": 1 }, "list": [1, 2] }
        });
        let row = ValuePath::row("cards");

        assert_eq!(row.child("slug").resolve(&contract), Some(&json!("foo")));
        assert_eq!(row.child("name").resolve(&contract), Some(&Value::Null));
        // Columns missing from the document still exist in the table
        assert_eq!(row.child("updated_at").resolve(&contract), Some(&Value::Null));
        // Not a column
        assert_eq!(row.child("links").resolve(&contract), None);
        assert_eq!(row.child("data").child("a").child("b").resolve(&contract), Some(&json!(1)));
        assert_eq!(row.child("data").child("missing").resolve(&contract), None);
        assert_eq!(row.child("data").child("list").child("0").resolve(&contract), None);
    }
}
