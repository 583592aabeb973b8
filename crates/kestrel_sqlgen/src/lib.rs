//! SQL statement compilation for metric leaf queries: the statement AST,
//! dialect capabilities, the multi-stage compiler and the text generator.

pub mod ast;
pub mod builder;
pub mod dialect;
pub mod generator;
#[cfg(test)]
mod tests;

pub use ast::{SelectStatement, SqlExpr, StageKind};
pub use builder::{
    Aggregator, SelectPipeline, SelectStatementBuilder, INSTANCE_COUNT_MACRO, INTERVAL_MACRO,
    SCALAR_FUNCTIONS,
};
pub use dialect::{dialect_for, ClickHouseDialect, H2Dialect, MySqlDialect, SqlDialect};
pub use generator::SqlGenerator;

use kestrel_common::config::SqlConfig;
use kestrel_common::error::CompileError;
use kestrel_expr::metric::MetricQuery;

/// Compile and render one data-source query in a single call.
pub fn compile_sql(
    dialect: &dyn SqlDialect,
    query: &MetricQuery,
    config: &SqlConfig,
) -> Result<String, CompileError> {
    let pipeline = SelectStatementBuilder::from_query(dialect, query, config).build()?;
    let sql = SqlGenerator::new(dialect).generate(&pipeline.statement);
    tracing::debug!(dialect = dialect.name(), data_source = %query.data_source, %sql, "generated sql");
    Ok(sql)
}
