//! Asynchronous query-step execution.
//!
//! Steps are evaluated bottom-up. Binary steps poll both children together
//! with `tokio::try_join!`; the first child error drops the other branch,
//! and dropping the returned future cancels every in-flight leaf fetch.
//! Identical leaf queries within one plan (the base of an offset delta) are
//! fetched once and shared.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use kestrel_common::error::ExecutionError;
use kestrel_common::types::{ArithmeticOp, CompareOp};
use kestrel_expr::metric::MetricQuery;
use kestrel_observability::{record_key_mismatch, record_leaf_fetch};
use kestrel_planner::{QueryStep, VALUE_COLUMN};

use crate::column_ops::{column_column, column_scalar, matching_rows, scalar_column};
use crate::columnar::{Column, ColumnarTable};
use crate::hash_join::hash_join;
use crate::result::IntermediateQueryResult;
use crate::source::DataSourceClient;

pub type StepFuture<'a> =
    Pin<Box<dyn Future<Output = Result<IntermediateQueryResult, ExecutionError>> + Send + 'a>>;

/// Evaluates physical plans against one data-source client.
#[derive(Clone)]
pub struct Executor {
    source: Arc<dyn DataSourceClient>,
}

impl Executor {
    pub fn new(source: Arc<dyn DataSourceClient>) -> Self {
        Self { source }
    }

    pub fn execute<'a>(&'a self, step: &'a QueryStep) -> StepFuture<'a> {
        Box::pin(async move {
            let leaves = LeafCache::default();
            self.run(step, &leaves).await
        })
    }

    fn run<'a>(&'a self, step: &'a QueryStep, leaves: &'a LeafCache) -> StepFuture<'a> {
        match step {
            QueryStep::Literal { value } => {
                Box::pin(async move { IntermediateQueryResult::literal(value, VALUE_COLUMN) })
            }
            QueryStep::MetricAggregate { query } => Box::pin(async move {
                let cell = leaves.cell(query);
                let result = cell.get_or_try_init(|| self.fetch(query)).await?;
                Ok(result.clone())
            }),
            QueryStep::Arithmetic {
                op,
                lhs,
                rhs,
                result_column,
                retained_columns,
            } => Box::pin(async move {
                let (left, right) = tokio::try_join!(self.run(lhs, leaves), self.run(rhs, leaves))?;
                combine(*op, &left, &right, result_column, retained_columns)
            }),
            QueryStep::Filter {
                op,
                threshold,
                input,
            } => Box::pin(async move {
                let result = self.run(input, leaves).await?;
                filter(*op, *threshold, result)
            }),
        }
    }

    async fn fetch(&self, query: &MetricQuery) -> Result<IntermediateQueryResult, ExecutionError> {
        tracing::debug!(
            data_source = %query.data_source,
            selectors = query.selectors.len(),
            "fetching leaf"
        );
        let started = Instant::now();
        let table = self.source.query(query).await?;
        record_leaf_fetch(
            &query.data_source,
            table.row_count(),
            started.elapsed().as_micros() as u64,
        );
        IntermediateQueryResult::from_leaf(table, query)
    }
}

/// Leaf results of one `execute` call, keyed by query. A leaf whose fetch
/// fails or is dropped leaves its cell empty.
#[derive(Default)]
struct LeafCache {
    cells: Mutex<Vec<(MetricQuery, Arc<OnceCell<IntermediateQueryResult>>)>>,
}

impl LeafCache {
    fn cell(&self, query: &MetricQuery) -> Arc<OnceCell<IntermediateQueryResult>> {
        let mut cells = self.cells.lock();
        if let Some((_, cell)) = cells.iter().find(|(q, _)| q == query) {
            return cell.clone();
        }
        let cell = Arc::new(OnceCell::new());
        cells.push((query.clone(), cell.clone()));
        cell
    }
}

/// Keep the rows whose first value column satisfies `value op threshold`.
pub fn filter(
    op: CompareOp,
    threshold: f64,
    input: IntermediateQueryResult,
) -> Result<IntermediateQueryResult, ExecutionError> {
    let rows = matching_rows(op, input.first_value_column()?, threshold)?;
    let table = input.table.take_rows(&rows);
    IntermediateQueryResult::new(table, input.interval, input.key_columns, input.value_columns)
}

/// Combine two child results with `op` per the scalar/vector pairing rules.
pub fn combine(
    op: ArithmeticOp,
    left: &IntermediateQueryResult,
    right: &IntermediateQueryResult,
    result_column: &str,
    retained_columns: &[String],
) -> Result<IntermediateQueryResult, ExecutionError> {
    match (left.is_scalar(), right.is_scalar()) {
        (true, true) => combine_scalars(op, left, right, result_column, retained_columns),
        (true, false) => broadcast(right, |column| {
            scalar_column(op, left.scalar_value()?, column, &column.name)
        }),
        (false, true) => broadcast(left, |column| {
            column_scalar(op, column, right.scalar_value()?, &column.name)
        }),
        (false, false) => join_vectors(op, left, right, result_column, retained_columns),
    }
}

fn combine_scalars(
    op: ArithmeticOp,
    left: &IntermediateQueryResult,
    right: &IntermediateQueryResult,
    result_column: &str,
    retained_columns: &[String],
) -> Result<IntermediateQueryResult, ExecutionError> {
    let value = op.apply(left.scalar_value()?, right.scalar_value()?);
    let mut table = ColumnarTable::from_columns(vec![Column::float64(result_column, vec![value])])?;
    let mut values = vec![result_column.to_string()];
    for name in retained_columns {
        if table.contains(name) {
            continue;
        }
        let column = left
            .table
            .column(name)
            .or_else(|| right.table.column(name))
            .ok_or_else(|| ExecutionError::ColumnNotFound(name.clone()))?;
        table.add_column(column.take(&[0]))?;
        values.push(name.clone());
    }
    IntermediateQueryResult::new(
        table,
        left.interval.or(right.interval),
        Vec::new(),
        values,
    )
}

/// Apply `apply` to every value column of `vector`; keys and names unchanged.
fn broadcast(
    vector: &IntermediateQueryResult,
    apply: impl Fn(&Column) -> Result<Column, ExecutionError>,
) -> Result<IntermediateQueryResult, ExecutionError> {
    let mut table = ColumnarTable::new();
    for key in &vector.key_columns {
        table.add_column(vector.table.require(key)?.clone())?;
    }
    for name in &vector.value_columns {
        table.add_column(apply(vector.table.require(name)?)?)?;
    }
    IntermediateQueryResult::new(
        table,
        vector.interval,
        vector.key_columns.clone(),
        vector.value_columns.clone(),
    )
}

fn join_vectors(
    op: ArithmeticOp,
    left: &IntermediateQueryResult,
    right: &IntermediateQueryResult,
    result_column: &str,
    retained_columns: &[String],
) -> Result<IntermediateQueryResult, ExecutionError> {
    if left.key_columns != right.key_columns {
        tracing::warn!(
            left = ?left.key_columns,
            right = ?right.key_columns,
            "key columns differ, returning empty result"
        );
        record_key_mismatch();
        return IntermediateQueryResult::empty(left, result_column);
    }

    let keys = &left.key_columns;
    let joined = hash_join(&left.table, keys, &right.table, keys)?;

    let mut table = ColumnarTable::new();
    for key in keys {
        table.add_column(left.table.require(key)?.take(&joined.left))?;
    }
    let lhs = left.first_value_column()?.take(&joined.left);
    let rhs = right.first_value_column()?.take(&joined.right);
    table.add_column(column_column(op, &lhs, &rhs, result_column)?)?;
    let mut values = vec![result_column.to_string()];

    let rest = left
        .value_columns
        .iter()
        .skip(1)
        .map(|name| (left, name, &joined.left))
        .chain(
            right
                .value_columns
                .iter()
                .skip(1)
                .map(|name| (right, name, &joined.right)),
        );
    for (side, name, rows) in rest {
        if table.contains(name) {
            continue;
        }
        table.add_column(side.table.require(name)?.take(rows))?;
        values.push(name.clone());
    }

    for name in retained_columns {
        if table.contains(name) {
            continue;
        }
        let column = match left.table.column(name) {
            Some(column) => column.take(&joined.left),
            None => right.table.require(name)?.take(&joined.right),
        };
        table.add_column(column)?;
        values.push(name.clone());
    }

    IntermediateQueryResult::new(
        table,
        left.interval.or(right.interval),
        keys.clone(),
        values,
    )
}
