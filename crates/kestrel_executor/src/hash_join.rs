//! Inner hash join on key columns.
//!
//! Build phase hashes the right table's key tuples; probe phase scans the
//! left table in order, so output rows follow left row order.

use std::collections::HashMap;

use kestrel_common::datum::Datum;
use kestrel_common::error::ExecutionError;

use crate::columnar::{Column, ColumnarTable};

/// Matched row index pairs, one entry per output row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinIndices {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
}

impl JoinIndices {
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

fn key_columns<'t>(
    table: &'t ColumnarTable,
    keys: &[String],
) -> Result<Vec<&'t Column>, ExecutionError> {
    keys.iter().map(|k| table.require(k)).collect()
}

fn key_at(columns: &[&Column], row: usize) -> Vec<Datum> {
    columns.iter().map(|c| c.get_datum(row)).collect()
}

/// Join `left` and `right` where `left_keys[i] == right_keys[i]` for all i.
pub fn hash_join(
    left: &ColumnarTable,
    left_keys: &[String],
    right: &ColumnarTable,
    right_keys: &[String],
) -> Result<JoinIndices, ExecutionError> {
    if left_keys.len() != right_keys.len() {
        return Err(ExecutionError::Internal(format!(
            "hash join key arity mismatch: {} vs {}",
            left_keys.len(),
            right_keys.len()
        )));
    }
    let left_cols = key_columns(left, left_keys)?;
    let right_cols = key_columns(right, right_keys)?;

    // Build phase: key tuple -> right row indices
    let mut hash_table: HashMap<Vec<Datum>, Vec<usize>> = HashMap::new();
    for ri in 0..right.row_count() {
        hash_table
            .entry(key_at(&right_cols, ri))
            .or_default()
            .push(ri);
    }

    // Probe phase
    let mut out = JoinIndices::default();
    for li in 0..left.row_count() {
        if let Some(matches) = hash_table.get(&key_at(&left_cols, li)) {
            for &ri in matches {
                out.left.push(li);
                out.right.push(ri);
            }
        }
    }
    Ok(out)
}
