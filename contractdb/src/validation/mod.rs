// Contract validation - checks a contract against a schema with the same
// semantics the compiled queries have

use crate::error::{ContractDbError, Result};
use crate::schema::{Schema, SchemaObject};
use crate::sql::{compile_row, BuilderContext, CompareOp, LinkResolver, SqlFilter, ValuePath};
use serde_json::Value;

const SCOPE: &str = "contract";
const KNOWN_FORMATS: &[&str] = &["uuid", "email", "date", "date-time", "uri"];

/// Result of validating a contract
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A schema compiled once for validating many contracts.
#[derive(Debug, Clone)]
pub struct Validator {
    filter: SqlFilter,
    warnings: Vec<String>,
}

impl Validator {
    pub fn new(schema: &Schema) -> Result<Self> {
        let mut ctx = BuilderContext::new(SCOPE, compile_row);
        let filter = compile_row(&mut ctx, schema)?;
        let mut warnings = Vec::new();
        collect_warnings(schema, "", true, &mut warnings);
        Ok(Validator { filter, warnings })
    }

    /// Whether `contract` satisfies the schema.
    pub fn accepts(&self, contract: &Value, resolver: &dyn LinkResolver) -> Result<bool> {
        Ok(self.filter.matches(SCOPE, contract, resolver)?.is_some())
    }

    /// Validate `contract`, describing every failed constraint.
    pub fn validate(&self, contract: &Value, resolver: &dyn LinkResolver) -> Result<ValidationResult> {
        let mut result = ValidationResult {
            errors: Vec::new(),
            warnings: self.warnings.clone(),
        };
        if !self.accepts(contract, resolver)? {
            explain(&self.filter, contract, resolver, &mut result.errors)?;
            if result.errors.is_empty() {
                result.errors.push("Contract does not match the schema".into());
            }
        }
        Ok(result)
    }
}

/// Validate a contract against a schema.
pub fn validate_contract(
    schema: &Schema,
    contract: &Value,
    resolver: &dyn LinkResolver,
) -> Result<ValidationResult> {
    Validator::new(schema)?.validate(contract, resolver)
}

/// Validate and turn failures into a `SchemaMismatch` error listing them.
pub fn check_contract(schema: &Schema, contract: &Value, resolver: &dyn LinkResolver) -> Result<()> {
    let result = validate_contract(schema, contract, resolver)?;
    for warning in &result.warnings {
        log::debug!("Schema warning: {warning}");
    }
    if result.is_ok() {
        Ok(())
    } else {
        Err(ContractDbError::SchemaMismatch(result.errors.join("; ")))
    }
}

fn holds(filter: &SqlFilter, contract: &Value, resolver: &dyn LinkResolver) -> Result<bool> {
    Ok(filter.matches(SCOPE, contract, resolver)?.is_some())
}

/// Walk down conjunctions and property conditions to the constraints that
/// failed.
fn explain(
    filter: &SqlFilter,
    contract: &Value,
    resolver: &dyn LinkResolver,
    out: &mut Vec<String>,
) -> Result<()> {
    match filter {
        SqlFilter::And(children) => {
            for child in children {
                if !holds(child, contract, resolver)? {
                    explain(child, contract, resolver, out)?;
                }
            }
        }
        // "when present" / "when of this type" guards
        SqlFilter::Or(branches)
            if branches.len() == 2
                && matches!(
                    &branches[0],
                    SqlFilter::Not(inner) if matches!(**inner, SqlFilter::Present(_) | SqlFilter::TypeIs(..))
                ) =>
        {
            explain(&branches[1], contract, resolver, out)?;
        }
        other => out.push(describe(other)),
    }
    Ok(())
}

fn pointer(path: &ValuePath) -> String {
    if path.keys.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", path.keys.join("/"))
    }
}

fn op_text(op: &CompareOp) -> &'static str {
    match op {
        CompareOp::Lt => "less than",
        CompareOp::Le => "at most",
        CompareOp::Gt => "greater than",
        CompareOp::Ge => "at least",
    }
}

fn describe(filter: &SqlFilter) -> String {
    match filter {
        SqlFilter::False => "Contract is rejected by the schema".into(),
        SqlFilter::Present(path) => format!("Required property '{}' is missing", pointer(path)),
        SqlFilter::TypeIs(path, types) => {
            let names: Vec<String> = types
                .iter()
                .map(|t| serde_json::to_value(t).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default())
                .collect();
            format!("'{}' must be of type {}", pointer(path), names.join(" or "))
        }
        SqlFilter::Equals(path, value) => format!("'{}' must be equal to {value}", pointer(path)),
        SqlFilter::OneOf(path, values) => {
            let values: Vec<String> = values.iter().map(Value::to_string).collect();
            format!("'{}' must be one of {}", pointer(path), values.join(", "))
        }
        SqlFilter::Matches { path, pattern } => {
            format!("'{}' must match the pattern {}", pointer(path), pattern.as_str())
        }
        SqlFilter::Compare { path, op, value } => {
            format!("'{}' must be {} {value}", pointer(path), op_text(op))
        }
        SqlFilter::Length { path, op, value } => {
            format!("'{}' must be {} {value} characters long", pointer(path), op_text(op))
        }
        SqlFilter::ItemCount { path, op, value } => {
            format!("'{}' must have {} {value} items", pointer(path), op_text(op))
        }
        SqlFilter::FullText { path, term } => format!("'{}' must contain \"{term}\"", pointer(path)),
        SqlFilter::Each { path, .. } => format!("'{}' has members that do not match", pointer(path)),
        SqlFilter::Link { link_type, .. } => format!("No matching contract linked through '{link_type}'"),
        SqlFilter::Not(_) => "Contract matches a forbidden schema".into(),
        SqlFilter::Or(_) => "Contract matches none of the alternatives".into(),
        SqlFilter::True | SqlFilter::And(_) => "Contract does not match the schema".into(),
    }
}

fn collect_warnings(schema: &Schema, at: &str, row: bool, out: &mut Vec<String>) {
    let Schema::Object(object) = schema else {
        return;
    };
    let SchemaObject {
        format,
        additional_properties,
        properties,
        all_of,
        any_of,
        not,
        items,
        contains,
        ..
    } = object.as_ref();

    let location = if at.is_empty() { "/" } else { at };
    if let Some(format) = format {
        if !KNOWN_FORMATS.contains(&format.as_str()) {
            out.push(format!("Unsupported format '{format}' at '{location}' is ignored"));
        }
    }
    if row && additional_properties.is_some() {
        out.push("additionalProperties on a contract is only used for permissions".into());
    }
    if let Some(properties) = properties {
        for (name, property) in properties {
            collect_warnings(property, &format!("{at}/{name}"), false, out);
        }
    }
    for branch in all_of.iter().flatten().chain(any_of.iter().flatten()).chain(not.iter()) {
        collect_warnings(branch, at, row, out);
    }
    for member in items.iter().chain(contains.iter()) {
        collect_warnings(member, &format!("{at}/*"), false, out);
    }
}
