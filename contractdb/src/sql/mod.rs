// Schema to SQL compilation

mod context;
mod filter;
mod fragment;
mod path;
mod query;

pub use context::{links_alias, BuilderContext, FragmentCompiler, LinkNode, Variant};
pub use filter::{
    json_equal, ts_query, Bindings, CompareOp, EachSource, LinkMatch, LinkMatches, LinkResolver,
    Params, Pattern, Quantifier, SqlFilter,
};
pub use fragment::{compile_row, FragmentBuilder};
pub use path::{quote_ident, quote_literal, Scope, ValuePath, ROW_COLUMNS};
pub use query::{QueryOptions, SortDir, SqlQuery, Tables, CONTRACT_COLUMN, ID_COLUMN};

use crate::error::Result;
use crate::schema::Schema;
use crate::select::SelectMap;

/// Compile a schema into one statement over `tables`, returning `select`
/// for every matching contract.
pub fn compile(
    tables: &Tables,
    select: &SelectMap,
    schema: &Schema,
    options: &QueryOptions,
) -> Result<SqlQuery> {
    let mut ctx = BuilderContext::new(&tables.contracts, compile_row);
    let filter = compile_row(&mut ctx, schema)?;
    let links = ctx.into_links();
    SqlQuery::assemble(tables, select, filter, links, options)
}
