//! In-memory data source.
//!
//! Evaluates leaf queries directly over registered tables: interval and raw
//! filter, group-by plus bucket grouping, selector aggregation, the
//! post-aggregation predicate, then order and limit. Answers follow the same
//! column layout as the SQL path, so plans can be tested without a database.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;

use kestrel_common::datum::Datum;
use kestrel_common::error::{CompileError, ExecutionError};
use kestrel_common::types::{QueryInterval, TIMESTAMP_COLUMN};
use kestrel_expr::metric::MetricQuery;
use kestrel_expr::types::{AggregateFunction, BinaryOp, Expr};
use kestrel_sqlgen::{INSTANCE_COUNT_MACRO, INTERVAL_MACRO, SCALAR_FUNCTIONS};

use crate::columnar::{Column, ColumnarTable};
use crate::source::DataSourceClient;

type Lookup<'l> = dyn Fn(&str) -> Result<Datum, ExecutionError> + 'l;

/// Named tables of raw metric rows.
pub struct MemoryDataSource {
    tables: RwLock<HashMap<String, ColumnarTable>>,
    timestamp_column: String,
    instance_column: String,
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            timestamp_column: "timestamp".to_string(),
            instance_column: "instanceName".to_string(),
        }
    }

    pub fn with_timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = column.into();
        self
    }

    pub fn with_instance_column(mut self, column: impl Into<String>) -> Self {
        self.instance_column = column.into();
        self
    }

    /// Register (or replace) a table. Its timestamp column must exist and be
    /// numeric epoch seconds.
    pub fn register(
        &self,
        name: impl Into<String>,
        table: ColumnarTable,
    ) -> Result<(), ExecutionError> {
        table.require(&self.timestamp_column)?.numeric_values()?;
        self.tables.write().insert(name.into(), table);
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> Option<ColumnarTable> {
        self.tables.write().remove(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn run(&self, query: &MetricQuery) -> Result<ColumnarTable, ExecutionError> {
        let tables = self.tables.read();
        let table = tables
            .get(&query.data_source)
            .ok_or_else(|| ExecutionError::UnknownDataSource(query.data_source.clone()))?;
        let interval = query.effective_interval();
        if !interval.has_valid_step() {
            return Err(CompileError::InvalidInterval(format!("{:?}", interval)).into());
        }
        let timestamps = table.require(&self.timestamp_column)?.numeric_values()?;

        let mut rows = Vec::new();
        for (row, ts) in timestamps.iter().enumerate() {
            if *ts < interval.start as f64 || *ts >= interval.end as f64 {
                continue;
            }
            if let Some(filter) = &query.filter {
                let lookup = |name: &str| table.require(name).map(|c| c.get_datum(row));
                if !eval_predicate(filter, &lookup, &interval)? {
                    continue;
                }
            }
            rows.push(row);
        }

        let groups = self.group_rows(table, query, &interval, &timestamps, &rows)?;
        let scope = GroupScope {
            source: self,
            table,
            query,
            interval,
            timestamps: &timestamps,
        };

        let mut columns = Vec::new();
        let key_width = query.group_by.len() + usize::from(interval.is_windowed());
        for (i, name) in query.group_by.iter().enumerate() {
            let values: Vec<Datum> = groups.iter().map(|g| g.key[i].clone()).collect();
            columns.push(Column::from_datums(name.clone(), &values));
        }
        if interval.is_windowed() {
            let labels: Vec<i64> = groups
                .iter()
                .filter_map(|g| g.key.last().and_then(Datum::as_i64))
                .collect();
            columns.push(Column::int64(TIMESTAMP_COLUMN, labels));
        }
        for selector in &query.selectors {
            let values = groups
                .iter()
                .map(|g| scope.aggregate_expr(&selector.expr, &g.key[..key_width], &g.rows))
                .collect::<Result<Vec<_>, _>>()?;
            columns.push(Column::from_datums(selector.output.clone(), &values));
        }
        let mut out = ColumnarTable::from_columns(columns)?;
        if out.num_columns() == 0 {
            return Ok(out);
        }

        if let Some(predicate) = &query.predicate {
            let mut keep = Vec::new();
            for row in 0..out.row_count() {
                let lookup = |name: &str| out.require(name).map(|c| c.get_datum(row));
                if eval_predicate(predicate, &lookup, &interval)? {
                    keep.push(row);
                }
            }
            out = out.take_rows(&keep);
        }

        let mut order: Vec<usize> = (0..out.row_count()).collect();
        if let Some(order_by) = &query.order_by {
            let column = out.require(&order_by.column)?;
            order.sort_by(|a, b| {
                let ord = column
                    .get_datum(*a)
                    .partial_cmp(&column.get_datum(*b))
                    .unwrap_or(std::cmp::Ordering::Equal);
                if order_by.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = &query.limit {
            order = order
                .into_iter()
                .skip(limit.offset)
                .take(limit.limit)
                .collect();
        }
        if query.order_by.is_some() || query.limit.is_some() {
            out = out.take_rows(&order);
        }
        Ok(out)
    }

    /// Group the selected rows by group-by values and bucket label, in
    /// first-seen order. A scalar query always yields exactly one group.
    fn group_rows(
        &self,
        table: &ColumnarTable,
        query: &MetricQuery,
        interval: &QueryInterval,
        timestamps: &[f64],
        rows: &[usize],
    ) -> Result<Vec<Group>, ExecutionError> {
        let group_cols = query
            .group_by
            .iter()
            .map(|g| table.require(g))
            .collect::<Result<Vec<_>, _>>()?;
        let shift = query.offset.as_ref().map_or(0, |o| o.seconds());

        let mut groups: Vec<Group> = Vec::new();
        let mut index: HashMap<Vec<Datum>, usize> = HashMap::new();
        for &row in rows {
            let mut key: Vec<Datum> = group_cols.iter().map(|c| c.get_datum(row)).collect();
            if let Some(step) = interval.step {
                let ts = timestamps[row].floor() as i64;
                key.push(Datum::Int64(ts.div_euclid(step) * step + shift));
            }
            match index.get(&key) {
                Some(&g) => groups[g].rows.push(row),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(Group {
                        key,
                        rows: vec![row],
                    });
                }
            }
        }
        if groups.is_empty() && query.is_scalar() {
            groups.push(Group {
                key: Vec::new(),
                rows: Vec::new(),
            });
        }
        Ok(groups)
    }
}

#[async_trait]
impl DataSourceClient for MemoryDataSource {
    async fn query(&self, query: &MetricQuery) -> Result<ColumnarTable, ExecutionError> {
        let started = Instant::now();
        let table = self.run(query)?;
        tracing::debug!(
            data_source = %query.data_source,
            rows = table.row_count(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "memory query answered"
        );
        Ok(table)
    }
}

struct Group {
    key: Vec<Datum>,
    rows: Vec<usize>,
}

/// Everything selector evaluation needs for one query.
struct GroupScope<'a> {
    source: &'a MemoryDataSource,
    table: &'a ColumnarTable,
    query: &'a MetricQuery,
    interval: QueryInterval,
    timestamps: &'a [f64],
}

impl GroupScope<'_> {
    /// Evaluate a selector expression over one group of rows.
    fn aggregate_expr(
        &self,
        expr: &Expr,
        key: &[Datum],
        rows: &[usize],
    ) -> Result<Datum, ExecutionError> {
        match expr {
            Expr::Literal(d) => Ok(d.clone()),
            Expr::Identifier(name) => {
                if let Some(pos) = self.query.group_by.iter().position(|g| g == name) {
                    return Ok(key[pos].clone());
                }
                if name == TIMESTAMP_COLUMN && self.interval.is_windowed() {
                    return Ok(key.last().cloned().unwrap_or(Datum::Null));
                }
                Err(CompileError::InvalidExpression(format!(
                    "column {} must be aggregated or listed in group by",
                    name
                ))
                .into())
            }
            Expr::Macro(name) if name == INSTANCE_COUNT_MACRO => {
                let instance = Expr::ident(self.source.instance_column.clone());
                self.aggregate(AggregateFunction::Cardinality, Some(&instance), rows)
            }
            Expr::Macro(name) => eval_macro(name, &self.interval),
            Expr::Function { name, args } => match AggregateFunction::from_name(name) {
                Some(func) => {
                    let arg = match (func, args.as_slice()) {
                        (AggregateFunction::Count, []) => None,
                        (_, [arg]) => Some(arg),
                        _ => {
                            return Err(CompileError::ArgumentCount {
                                function: func.name().to_string(),
                                expected: if func == AggregateFunction::Count {
                                    "0 or 1".to_string()
                                } else {
                                    "1".to_string()
                                },
                                got: args.len(),
                            }
                            .into())
                        }
                    };
                    self.aggregate(func, arg, rows)
                }
                None => {
                    let values = args
                        .iter()
                        .map(|a| self.aggregate_expr(a, key, rows))
                        .collect::<Result<Vec<_>, _>>()?;
                    scalar_function(name, &values)
                }
            },
            Expr::Binary { op, left, right } => {
                let l = self.aggregate_expr(left, key, rows)?;
                let r = self.aggregate_expr(right, key, rows)?;
                arithmetic(*op, &l, &r)
            }
            other => Err(CompileError::InvalidExpression(format!(
                "{} is not a column expression",
                other
            ))
            .into()),
        }
    }

    fn aggregate(
        &self,
        func: AggregateFunction,
        arg: Option<&Expr>,
        rows: &[usize],
    ) -> Result<Datum, ExecutionError> {
        let arg = match arg {
            Some(arg) => arg,
            None => return Ok(Datum::Int64(rows.len() as i64)),
        };
        let mut values = Vec::with_capacity(rows.len());
        for &row in rows {
            let lookup = |name: &str| self.table.require(name).map(|c| c.get_datum(row));
            let value = eval_value(arg, &lookup, &self.interval, Some(func))?;
            if !value.is_null() {
                values.push((self.timestamps[row], value));
            }
        }
        Ok(fold(func, values))
    }
}

/// Reduce `(timestamp, value)` pairs; NULL inputs have already been dropped.
fn fold(func: AggregateFunction, values: Vec<(f64, Datum)>) -> Datum {
    match func {
        AggregateFunction::Count => Datum::Int64(values.len() as i64),
        AggregateFunction::Sum => {
            let exact = if values.iter().all(|(_, v)| matches!(v, Datum::Int64(_))) {
                values
                    .iter()
                    .filter_map(|(_, v)| v.as_i64())
                    .try_fold(0i64, i64::checked_add)
            } else {
                None
            };
            // Mixed inputs or an i64 overflow fall back to double precision.
            match exact {
                Some(total) => Datum::Int64(total),
                None => Datum::Float64(values.iter().filter_map(|(_, v)| v.as_f64()).sum()),
            }
        }
        AggregateFunction::Avg => {
            if values.is_empty() {
                return Datum::Null;
            }
            let sum: f64 = values.iter().filter_map(|(_, v)| v.as_f64()).sum();
            Datum::Float64(sum / values.len() as f64)
        }
        AggregateFunction::Min => extreme(values, |a, b| b < a),
        AggregateFunction::Max => extreme(values, |a, b| b > a),
        AggregateFunction::First => positional(values, |best, ts| ts < best),
        AggregateFunction::Last => positional(values, |best, ts| ts >= best),
        AggregateFunction::Cardinality => {
            let distinct: HashSet<Datum> = values.into_iter().map(|(_, v)| v).collect();
            Datum::Int64(distinct.len() as i64)
        }
        AggregateFunction::GroupConcat => {
            let mut seen = HashSet::new();
            let parts: Vec<String> = values
                .into_iter()
                .filter(|(_, v)| seen.insert(v.clone()))
                .map(|(_, v)| v.to_string())
                .collect();
            Datum::Text(parts.join(","))
        }
    }
}

fn extreme(values: Vec<(f64, Datum)>, replaces: impl Fn(&Datum, &Datum) -> bool) -> Datum {
    let mut best: Option<Datum> = None;
    for (_, value) in values {
        best = match best {
            Some(current) if !replaces(&current, &value) => Some(current),
            _ => Some(value),
        };
    }
    best.unwrap_or(Datum::Null)
}

fn positional(values: Vec<(f64, Datum)>, replaces: impl Fn(f64, f64) -> bool) -> Datum {
    let mut best: Option<(f64, Datum)> = None;
    for (ts, value) in values {
        best = match best {
            Some((best_ts, current)) if !replaces(best_ts, ts) => Some((best_ts, current)),
            _ => Some((ts, value)),
        };
    }
    best.map_or(Datum::Null, |(_, v)| v)
}

// ---------------------------------------------------------------------------
// Row-level evaluation (raw filters, aggregate arguments, predicates)
// ---------------------------------------------------------------------------

fn eval_value(
    expr: &Expr,
    lookup: &Lookup<'_>,
    interval: &QueryInterval,
    inside: Option<AggregateFunction>,
) -> Result<Datum, ExecutionError> {
    match expr {
        Expr::Literal(d) => Ok(d.clone()),
        Expr::Identifier(name) => lookup(name),
        Expr::Macro(name) if name == INSTANCE_COUNT_MACRO => {
            Err(CompileError::InvalidExpression(format!("{{{}}} is an aggregate", name)).into())
        }
        Expr::Macro(name) => eval_macro(name, interval),
        Expr::Function { name, args } => {
            if let Some(func) = AggregateFunction::from_name(name) {
                return Err(match inside {
                    Some(outer) => CompileError::NestedAggregator {
                        outer: outer.name().to_string(),
                        inner: func.name().to_string(),
                    },
                    None => CompileError::InvalidExpression(format!(
                        "aggregate {} is not allowed here",
                        expr
                    )),
                }
                .into());
            }
            let values = args
                .iter()
                .map(|a| eval_value(a, lookup, interval, inside))
                .collect::<Result<Vec<_>, _>>()?;
            scalar_function(name, &values)
        }
        Expr::Binary { op, left, right } if op.arithmetic().is_some() || *op == BinaryOp::Mod => {
            let l = eval_value(left, lookup, interval, inside)?;
            let r = eval_value(right, lookup, interval, inside)?;
            arithmetic(*op, &l, &r)
        }
        other => Err(ExecutionError::TypeError(format!(
            "{} does not produce a value",
            other
        ))),
    }
}

fn eval_predicate(
    expr: &Expr,
    lookup: &Lookup<'_>,
    interval: &QueryInterval,
) -> Result<bool, ExecutionError> {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => Ok(eval_predicate(left, lookup, interval)?
            && eval_predicate(right, lookup, interval)?),
        Expr::Binary {
            op: BinaryOp::Or,
            left,
            right,
        } => Ok(eval_predicate(left, lookup, interval)?
            || eval_predicate(right, lookup, interval)?),
        Expr::Not(inner) => Ok(!eval_predicate(inner, lookup, interval)?),
        Expr::Binary { op, left, right } if op.comparison().is_some() => {
            let l = eval_value(left, lookup, interval, None)?;
            let r = eval_value(right, lookup, interval, None)?;
            if l.is_null() || r.is_null() {
                return Ok(false);
            }
            Ok(match op {
                BinaryOp::Eq => l == r,
                BinaryOp::Ne => l != r,
                BinaryOp::Lt => l < r,
                BinaryOp::Lte => l <= r,
                BinaryOp::Gt => l > r,
                BinaryOp::Gte => l >= r,
                _ => false,
            })
        }
        other => Err(ExecutionError::TypeError(format!(
            "{} is not a boolean condition",
            other
        ))),
    }
}

fn eval_macro(name: &str, interval: &QueryInterval) -> Result<Datum, ExecutionError> {
    if name == INTERVAL_MACRO {
        Ok(Datum::Int64(interval.bucket_length()))
    } else {
        Err(CompileError::UnknownMacro(name.to_string()).into())
    }
}

fn numeric(value: &Datum) -> Result<f64, ExecutionError> {
    match value {
        Datum::Null => Ok(f64::NAN),
        other => other.as_f64().ok_or_else(|| {
            ExecutionError::TypeError(format!("{} is not numeric", other))
        }),
    }
}

fn arithmetic(op: BinaryOp, left: &Datum, right: &Datum) -> Result<Datum, ExecutionError> {
    let op = op
        .arithmetic()
        .ok_or_else(|| CompileError::UnsupportedOperator(op.symbol().to_string()))?;
    Ok(Datum::Float64(op.apply(numeric(left)?, numeric(right)?)))
}

fn scalar_function(name: &str, args: &[Datum]) -> Result<Datum, ExecutionError> {
    let known = SCALAR_FUNCTIONS
        .iter()
        .find(|f| f.eq_ignore_ascii_case(name))
        .ok_or_else(|| CompileError::UnknownFunction(name.to_string()))?;
    let x = match args {
        [x] => numeric(x)?,
        _ => {
            return Err(CompileError::ArgumentCount {
                function: known.to_string(),
                expected: "1".to_string(),
                got: args.len(),
            }
            .into())
        }
    };
    let y = match *known {
        "round" => x.round(),
        "abs" => x.abs(),
        "floor" => x.floor(),
        _ => x.ceil(),
    };
    Ok(Datum::Float64(y))
}
