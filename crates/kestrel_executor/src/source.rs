//! Data-source clients answering leaf queries.
//!
//! The executor only composes results; connection pooling, retries and
//! timeouts belong to the client behind this trait.

use std::time::Instant;

use async_trait::async_trait;

use kestrel_common::config::SqlConfig;
use kestrel_common::error::ExecutionError;
use kestrel_expr::metric::MetricQuery;
use kestrel_observability::record_sql_compile;
use kestrel_sqlgen::{dialect_for, SelectStatementBuilder, SqlDialect, SqlGenerator};

use crate::columnar::ColumnarTable;

/// Executes one group-by / filter / interval aggregate query.
///
/// The returned table holds the query's group-by columns, the bucket label
/// column for windowed queries, and one column per selector output.
#[async_trait]
pub trait DataSourceClient: Send + Sync {
    async fn query(&self, query: &MetricQuery) -> Result<ColumnarTable, ExecutionError>;
}

/// Something that runs SQL text and returns rows as a table.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ColumnarTable, ExecutionError>;
}

/// Answers leaf queries by compiling them to SQL for the configured dialect.
pub struct SqlDataSource<B> {
    backend: B,
    dialect: Box<dyn SqlDialect>,
    config: SqlConfig,
}

impl<B: SqlBackend> SqlDataSource<B> {
    pub fn new(backend: B, config: SqlConfig) -> Self {
        Self {
            backend,
            dialect: dialect_for(config.dialect),
            config,
        }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// The SQL text sent to the backend for `query`.
    pub fn compile(&self, query: &MetricQuery) -> Result<String, ExecutionError> {
        let dialect = self.dialect.as_ref();
        let pipeline = SelectStatementBuilder::from_query(dialect, query, &self.config).build()?;
        record_sql_compile(dialect.name(), pipeline.stages.len());
        Ok(SqlGenerator::new(dialect).generate(&pipeline.statement))
    }
}

#[async_trait]
impl<B: SqlBackend> DataSourceClient for SqlDataSource<B> {
    async fn query(&self, query: &MetricQuery) -> Result<ColumnarTable, ExecutionError> {
        let sql = self.compile(query)?;
        tracing::debug!(data_source = %query.data_source, %sql, "issuing sql");
        let started = Instant::now();
        let table = self.backend.execute(&sql).await.map_err(|e| match e {
            ExecutionError::DataSource { .. } => e,
            other => ExecutionError::DataSource {
                data_source: query.data_source.clone(),
                reason: other.to_string(),
            },
        })?;
        tracing::debug!(
            data_source = %query.data_source,
            rows = table.row_count(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "sql answered"
        );
        Ok(table)
    }
}
