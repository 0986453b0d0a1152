use super::context::BuilderContext;
use super::filter::{CompareOp, EachSource, Pattern, Quantifier, SqlFilter};
use super::path::ValuePath;
use crate::error::{ContractDbError, Result};
use crate::schema::{JsonType, Schema, SchemaObject};

const UUID_PATTERN: &str =
    "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";
const EMAIL_PATTERN: &str = "^[^@[:space:]]+@[^@[:space:]]+\\.[^@[:space:]]+$";
const DATE_PATTERN: &str = "^[0-9]{4}-[0-9]{2}-[0-9]{2}$";
const DATE_TIME_PATTERN: &str = "^[0-9]{4}-[0-9]{2}-[0-9]{2}[Tt ][0-9]{2}:[0-9]{2}:[0-9]{2}(\\.[0-9]+)?([Zz]|[+-][0-9]{2}:?[0-9]{2})$";
const URI_PATTERN: &str = "^[a-zA-Z][a-zA-Z0-9+.-]*:[^[:space:]]*$";

/// Compile `schema` against the row in the context's current scope. This is
/// the compiler handed to `BuilderContext`.
pub fn compile_row(ctx: &mut BuilderContext, schema: &Schema) -> Result<SqlFilter> {
    let row = ValuePath::row(ctx.current_scope());
    FragmentBuilder::new(ctx).compile(schema, &row)
}

/// Turns schema nodes into filters. Builders are cheap; the state lives in
/// the shared context.
pub struct FragmentBuilder<'c> {
    ctx: &'c mut BuilderContext,
}

impl<'c> FragmentBuilder<'c> {
    pub fn new(ctx: &'c mut BuilderContext) -> Self {
        FragmentBuilder { ctx }
    }

    pub fn compile(&mut self, schema: &Schema, path: &ValuePath) -> Result<SqlFilter> {
        match schema {
            Schema::Bool(true) => Ok(SqlFilter::True),
            Schema::Bool(false) => Ok(SqlFilter::False),
            Schema::Object(object) => self.compile_object(object, path),
        }
    }

    fn compile_object(&mut self, schema: &SchemaObject, path: &ValuePath) -> Result<SqlFilter> {
        let mut filters = Vec::new();

        if let Some(types) = &schema.types {
            filters.push(self.type_filter(&types.to_vec(), path));
        }
        if let Some(value) = &schema.const_value {
            filters.push(SqlFilter::Equals(path.clone(), value.clone()));
        }
        if let Some(values) = &schema.enum_values {
            filters.push(SqlFilter::OneOf(path.clone(), values.clone()));
        }

        let string = self.string_filters(schema, path)?;
        filters.push(only_for(JsonType::String, path, string));
        let number = number_filters(schema, path);
        filters.push(only_for(JsonType::Number, path, number));
        let array = self.array_filters(schema, path)?;
        filters.push(only_for(JsonType::Array, path, array));
        let object = self.object_filters(schema, path)?;
        filters.push(only_for(JsonType::Object, path, object));

        if let Some(search) = &schema.full_text_search {
            if let Some(term) = search.term() {
                filters.push(SqlFilter::FullText {
                    path: path.clone(),
                    term: term.to_string(),
                });
            }
        }

        if let Some(branches) = &schema.all_of {
            let mut all = Vec::with_capacity(branches.len());
            for branch in branches {
                all.push(self.compile(branch, path)?);
            }
            filters.push(SqlFilter::And(all));
        }
        if let Some(branches) = &schema.any_of {
            let mut any = Vec::with_capacity(branches.len());
            for branch in branches {
                any.push(self.compile(branch, path)?);
            }
            filters.push(SqlFilter::Or(any));
        }
        if let Some(negated) = &schema.not {
            filters.push(SqlFilter::Not(Box::new(self.compile(negated, path)?)));
        }

        if let Some(links) = &schema.links {
            if !path.is_row() {
                return Err(ContractDbError::Compile(format!(
                    "$$links is only allowed on contracts, found under /{}",
                    path.keys.join("/")
                )));
            }
            for (link_type, nested) in links {
                let parent = self.ctx.current_scope().to_string();
                let (alias, filter) = self.ctx.add_link(link_type, nested)?;
                filters.push(SqlFilter::Link {
                    parent,
                    link_type: link_type.clone(),
                    alias,
                    filter: Box::new(filter),
                });
            }
        }

        Ok(SqlFilter::and(filters))
    }

    fn type_filter(&self, types: &[JsonType], path: &ValuePath) -> SqlFilter {
        // A row is always an object
        if path.is_row() {
            return if types.contains(&JsonType::Object) {
                SqlFilter::True
            } else {
                SqlFilter::False
            };
        }
        SqlFilter::TypeIs(path.clone(), types.to_vec())
    }

    fn string_filters(&mut self, schema: &SchemaObject, path: &ValuePath) -> Result<Vec<SqlFilter>> {
        let mut filters = Vec::new();
        if let Some(pattern) = &schema.pattern {
            filters.push(matches(path, pattern, false)?);
        }
        if let Some(regexp) = &schema.regexp {
            filters.push(matches(path, &regexp.pattern, regexp.case_insensitive())?);
        }
        if let Some(format) = &schema.format {
            let pattern = match format.as_str() {
                "uuid" => Some(UUID_PATTERN),
                "email" => Some(EMAIL_PATTERN),
                "date" => Some(DATE_PATTERN),
                "date-time" => Some(DATE_TIME_PATTERN),
                "uri" => Some(URI_PATTERN),
                _ => None,
            };
            if let Some(pattern) = pattern {
                filters.push(matches(path, pattern, false)?);
            }
        }
        if let Some(min) = schema.min_length {
            filters.push(SqlFilter::Length {
                path: path.clone(),
                op: CompareOp::Ge,
                value: min,
            });
        }
        if let Some(max) = schema.max_length {
            filters.push(SqlFilter::Length {
                path: path.clone(),
                op: CompareOp::Le,
                value: max,
            });
        }
        Ok(filters)
    }

    fn array_filters(&mut self, schema: &SchemaObject, path: &ValuePath) -> Result<Vec<SqlFilter>> {
        let mut filters = Vec::new();
        if let Some(items) = &schema.items {
            filters.push(self.each(path, EachSource::Elements, Quantifier::All, items)?);
        }
        if let Some(contains) = &schema.contains {
            filters.push(self.each(path, EachSource::Elements, Quantifier::Any, contains)?);
        }
        if let Some(min) = schema.min_items {
            filters.push(SqlFilter::ItemCount {
                path: path.clone(),
                op: CompareOp::Ge,
                value: min,
            });
        }
        if let Some(max) = schema.max_items {
            filters.push(SqlFilter::ItemCount {
                path: path.clone(),
                op: CompareOp::Le,
                value: max,
            });
        }
        Ok(filters)
    }

    fn object_filters(&mut self, schema: &SchemaObject, path: &ValuePath) -> Result<Vec<SqlFilter>> {
        let mut filters = Vec::new();
        if let Some(required) = &schema.required {
            for name in required {
                filters.push(SqlFilter::Present(path.child(name)));
            }
        }
        if let Some(properties) = &schema.properties {
            for (name, property) in properties {
                let child = path.child(name);
                let filter = self.compile(property, &child)?;
                if filter == SqlFilter::True {
                    continue;
                }
                filters.push(SqlFilter::Or(vec![
                    SqlFilter::Not(Box::new(SqlFilter::Present(child))),
                    filter,
                ]));
            }
        }
        // On rows, `additionalProperties` only shapes what a role may see
        if let (Some(additional), false) = (&schema.additional_properties, path.is_row()) {
            if *additional != Schema::Bool(true) {
                let known = schema
                    .properties
                    .as_ref()
                    .map(|p| p.keys().cloned().collect())
                    .unwrap_or_default();
                filters.push(self.each(path, EachSource::ExtraValues(known), Quantifier::All, additional)?);
            }
        }
        Ok(filters)
    }

    fn each(
        &mut self,
        path: &ValuePath,
        source: EachSource,
        quantifier: Quantifier,
        schema: &Schema,
    ) -> Result<SqlFilter> {
        let alias = self.ctx.next_element_alias();
        let filter = self.compile(schema, &ValuePath::element(&alias))?;
        Ok(SqlFilter::Each {
            path: path.clone(),
            source,
            quantifier,
            alias,
            filter: Box::new(filter),
        })
    }
}

fn number_filters(schema: &SchemaObject, path: &ValuePath) -> Vec<SqlFilter> {
    let bounds = [
        (schema.minimum, CompareOp::Ge),
        (schema.maximum, CompareOp::Le),
        (schema.exclusive_minimum, CompareOp::Gt),
        (schema.exclusive_maximum, CompareOp::Lt),
    ];
    bounds
        .into_iter()
        .filter_map(|(bound, op)| {
            bound.map(|value| SqlFilter::Compare {
                path: path.clone(),
                op,
                value,
            })
        })
        .collect()
}

/// Invalid patterns are rejected here rather than when the statement runs.
fn matches(path: &ValuePath, pattern: &str, case_insensitive: bool) -> Result<SqlFilter> {
    Ok(SqlFilter::Matches {
        path: path.clone(),
        pattern: Pattern::new(pattern, case_insensitive)?,
    })
}

/// Keywords for one type constrain only values of that type.
fn only_for(json_type: JsonType, path: &ValuePath, filters: Vec<SqlFilter>) -> SqlFilter {
    let filter = SqlFilter::and(filters);
    if filter == SqlFilter::True {
        return SqlFilter::True;
    }
    if path.is_row() {
        return if json_type == JsonType::Object {
            filter
        } else {
            SqlFilter::True
        };
    }
    SqlFilter::Or(vec![
        SqlFilter::Not(Box::new(SqlFilter::TypeIs(path.clone(), vec![json_type]))),
        filter,
    ])
}
