//! Columnar table model.
//!
//! Key types:
//!   - `ColumnData`: a homogeneously typed value array
//!   - `Column`: a named `ColumnData`
//!   - `ColumnarTable`: ordered columns of equal length with O(1) name lookup
//!
//! Tables are built once and treated as immutable afterwards; operators
//! produce new tables rather than editing their inputs.

use std::collections::HashMap;

use kestrel_common::datum::Datum;
use kestrel_common::error::ExecutionError;

// ---------------------------------------------------------------------------
// ColumnData / Column
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    /// Dimension values (group-by keys) and concatenated strings.
    Text(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnData::Int64(_) => "int64",
            ColumnData::Float64(_) => "float64",
            ColumnData::Text(_) => "text",
        }
    }

    pub fn get_datum(&self, idx: usize) -> Datum {
        match self {
            ColumnData::Int64(v) => v.get(idx).map_or(Datum::Null, |x| Datum::Int64(*x)),
            ColumnData::Float64(v) => v.get(idx).map_or(Datum::Null, |x| Datum::Float64(*x)),
            ColumnData::Text(v) => v
                .get(idx)
                .map_or(Datum::Null, |x| Datum::Text(x.clone())),
        }
    }

    /// Gather the rows at `indices`, in that order.
    pub fn take(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::Int64(v) => ColumnData::Int64(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Float64(v) => {
                ColumnData::Float64(indices.iter().map(|&i| v[i]).collect())
            }
            ColumnData::Text(v) => {
                ColumnData::Text(indices.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }

    /// Build a column from datums, inferring the narrowest type that holds
    /// them all. Integers widen to floats when mixed with them; a NULL in a
    /// numeric column becomes NaN and in a text column the empty string.
    pub fn from_datums(datums: &[Datum]) -> ColumnData {
        let has_text = datums.iter().any(|d| matches!(d, Datum::Text(_)));
        let has_float = datums
            .iter()
            .any(|d| matches!(d, Datum::Float64(_) | Datum::Null));
        if has_text {
            ColumnData::Text(
                datums
                    .iter()
                    .map(|d| match d {
                        Datum::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect(),
            )
        } else if has_float {
            ColumnData::Float64(
                datums
                    .iter()
                    .map(|d| d.as_f64().unwrap_or(f64::NAN))
                    .collect(),
            )
        } else {
            ColumnData::Int64(datums.iter().filter_map(Datum::as_i64).collect())
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn int64(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(name, ColumnData::Int64(values))
    }

    pub fn float64(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, ColumnData::Float64(values))
    }

    pub fn text<S: Into<String>>(name: impl Into<String>, values: Vec<S>) -> Self {
        Self::new(
            name,
            ColumnData::Text(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn from_datums(name: impl Into<String>, datums: &[Datum]) -> Self {
        Self::new(name, ColumnData::from_datums(datums))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_datum(&self, idx: usize) -> Datum {
        self.data.get_datum(idx)
    }

    pub fn take(&self, indices: &[usize]) -> Column {
        Column::new(self.name.clone(), self.data.take(indices))
    }

    /// Same data under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Column {
        Column::new(name, self.data.clone())
    }

    /// The values widened to f64; text columns are a type error.
    pub fn numeric_values(&self) -> Result<Vec<f64>, ExecutionError> {
        match &self.data {
            ColumnData::Int64(v) => Ok(v.iter().map(|x| *x as f64).collect()),
            ColumnData::Float64(v) => Ok(v.clone()),
            ColumnData::Text(_) => Err(ExecutionError::TypeError(format!(
                "column {} is text, expected a numeric column",
                self.name
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ColumnarTable
// ---------------------------------------------------------------------------

/// Ordered columns sharing one row count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnarTable {
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    row_count: usize,
}

impl ColumnarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<Column>) -> Result<Self, ExecutionError> {
        let mut table = Self::new();
        for column in columns {
            table.add_column(column)?;
        }
        Ok(table)
    }

    /// Build a table from row-major datums; used by SQL backends.
    pub fn from_rows<S: AsRef<str>>(
        names: &[S],
        rows: &[Vec<Datum>],
    ) -> Result<Self, ExecutionError> {
        let mut columns = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let mut datums = Vec::with_capacity(rows.len());
            for row in rows {
                let value = row.get(i).cloned().ok_or_else(|| ExecutionError::RowCountMismatch {
                    column: name.as_ref().to_string(),
                    expected: names.len(),
                    got: row.len(),
                })?;
                datums.push(value);
            }
            columns.push(Column::from_datums(name.as_ref(), &datums));
        }
        let mut table = Self::from_columns(columns)?;
        table.row_count = rows.len();
        Ok(table)
    }

    /// Append a column. The first column fixes the row count; a column with
    /// an existing name replaces it in place.
    pub fn add_column(&mut self, column: Column) -> Result<(), ExecutionError> {
        if self.columns.is_empty() {
            self.row_count = column.len();
        } else if column.len() != self.row_count {
            let got = column.len();
            return Err(ExecutionError::RowCountMismatch {
                column: column.name,
                expected: self.row_count,
                got,
            });
        }
        match self.index.get(&column.name) {
            Some(&i) => self.columns[i] = column,
            None => {
                self.index.insert(column.name.clone(), self.columns.len());
                self.columns.push(column);
            }
        }
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    pub fn require(&self, name: &str) -> Result<&Column, ExecutionError> {
        self.column(name)
            .ok_or_else(|| ExecutionError::ColumnNotFound(name.to_string()))
    }

    /// One row as datums, in column order.
    pub fn row(&self, idx: usize) -> Vec<Datum> {
        self.columns.iter().map(|c| c.get_datum(idx)).collect()
    }

    /// A new table holding the rows at `indices`, in that order.
    pub fn take_rows(&self, indices: &[usize]) -> ColumnarTable {
        ColumnarTable {
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
            index: self.index.clone(),
            row_count: indices.len(),
        }
    }
}
