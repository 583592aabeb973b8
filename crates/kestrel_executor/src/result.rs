use serde_json::{Map, Value as JsonValue};

use kestrel_common::datum::Datum;
use kestrel_common::error::ExecutionError;
use kestrel_common::types::{QueryInterval, TIMESTAMP_COLUMN};
use kestrel_expr::metric::MetricQuery;

use crate::columnar::{Column, ColumnarTable};

/// Output of one executed query step.
///
/// Key columns identify a series (group-by dimensions, plus the bucket label
/// for windowed results); value columns hold computed metrics. A result is
/// scalar when it has no key columns and exactly one row.
#[derive(Debug, Clone, PartialEq)]
pub struct IntermediateQueryResult {
    pub table: ColumnarTable,
    /// `None` for results that never touched a data source (literals).
    pub interval: Option<QueryInterval>,
    pub key_columns: Vec<String>,
    pub value_columns: Vec<String>,
}

impl IntermediateQueryResult {
    pub fn new(
        table: ColumnarTable,
        interval: Option<QueryInterval>,
        key_columns: Vec<String>,
        value_columns: Vec<String>,
    ) -> Result<Self, ExecutionError> {
        for name in key_columns.iter().chain(&value_columns) {
            table.require(name)?;
        }
        Ok(Self {
            table,
            interval,
            key_columns,
            value_columns,
        })
    }

    /// A one-row, keyless result holding `value`.
    pub fn literal(value: &Datum, name: &str) -> Result<Self, ExecutionError> {
        let column = match value {
            Datum::Int64(v) => Column::int64(name, vec![*v]),
            Datum::Float64(v) => Column::float64(name, vec![*v]),
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "literal must be numeric, got {}",
                    other
                )))
            }
        };
        let table = ColumnarTable::from_columns(vec![column])?;
        Self::new(table, None, Vec::new(), vec![name.to_string()])
    }

    /// Wrap a data-source answer to `query`.
    pub fn from_leaf(table: ColumnarTable, query: &MetricQuery) -> Result<Self, ExecutionError> {
        let mut key_columns = query.group_by.clone();
        if query.interval.is_windowed() {
            key_columns.push(TIMESTAMP_COLUMN.to_string());
        }
        let value_columns = query.selectors.iter().map(|s| s.output.clone()).collect();
        Self::new(table, Some(query.interval), key_columns, value_columns)
    }

    /// Zero rows with the given key columns and a single empty value column.
    pub fn empty(
        template: &IntermediateQueryResult,
        value_column: &str,
    ) -> Result<Self, ExecutionError> {
        let mut table = ColumnarTable::new();
        for key in &template.key_columns {
            table.add_column(template.table.require(key)?.take(&[]))?;
        }
        table.add_column(Column::float64(value_column, Vec::new()))?;
        Self::new(
            table,
            template.interval,
            template.key_columns.clone(),
            vec![value_column.to_string()],
        )
    }

    pub fn is_scalar(&self) -> bool {
        self.key_columns.is_empty() && self.table.row_count() == 1
    }

    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }

    pub fn step(&self) -> Option<i64> {
        self.interval.and_then(|i| i.step)
    }

    /// The column arithmetic and filters operate on.
    pub fn first_value_column(&self) -> Result<&Column, ExecutionError> {
        let name = self
            .value_columns
            .first()
            .ok_or(ExecutionError::NoValueColumn)?;
        self.table.require(name)
    }

    /// The single value of a scalar result, widened to f64.
    pub fn scalar_value(&self) -> Result<f64, ExecutionError> {
        let values = self.first_value_column()?.numeric_values()?;
        values
            .first()
            .copied()
            .ok_or_else(|| ExecutionError::Internal("scalar result has no rows".into()))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<Datum> {
        self.table
            .column(column)
            .filter(|_| row < self.table.row_count())
            .map(|c| c.get_datum(row))
    }

    /// Rows as JSON objects, keys first then values.
    pub fn to_json_rows(&self) -> JsonValue {
        let names: Vec<&String> = self
            .key_columns
            .iter()
            .chain(&self.value_columns)
            .collect();
        let rows = (0..self.table.row_count())
            .map(|row| {
                let mut obj = Map::new();
                for name in &names {
                    let value = self
                        .value(row, name)
                        .and_then(|d| serde_json::to_value(d).ok())
                        .unwrap_or(JsonValue::Null);
                    obj.insert((*name).clone(), value);
                }
                JsonValue::Object(obj)
            })
            .collect();
        JsonValue::Array(rows)
    }
}
