//! Column operator library: elementwise arithmetic and threshold filters.
//!
//! All arithmetic runs in f64 whatever the storage type of the inputs, with
//! IEEE semantics (x / 0 is inf or NaN, never an error).

use kestrel_common::error::ExecutionError;
use kestrel_common::types::{ArithmeticOp, CompareOp};

use crate::columnar::Column;

/// `scalar op column[i]` for every row.
pub fn scalar_column(
    op: ArithmeticOp,
    scalar: f64,
    column: &Column,
    name: &str,
) -> Result<Column, ExecutionError> {
    let values = column.numeric_values()?;
    Ok(Column::float64(
        name,
        values.into_iter().map(|v| op.apply(scalar, v)).collect(),
    ))
}

/// `column[i] op scalar` for every row.
pub fn column_scalar(
    op: ArithmeticOp,
    column: &Column,
    scalar: f64,
    name: &str,
) -> Result<Column, ExecutionError> {
    let values = column.numeric_values()?;
    Ok(Column::float64(
        name,
        values.into_iter().map(|v| op.apply(v, scalar)).collect(),
    ))
}

/// `left[i] op right[i]`; both columns must have the same length.
pub fn column_column(
    op: ArithmeticOp,
    left: &Column,
    right: &Column,
    name: &str,
) -> Result<Column, ExecutionError> {
    if left.len() != right.len() {
        return Err(ExecutionError::RowCountMismatch {
            column: right.name.clone(),
            expected: left.len(),
            got: right.len(),
        });
    }
    let l = left.numeric_values()?;
    let r = right.numeric_values()?;
    Ok(Column::float64(
        name,
        l.into_iter()
            .zip(r)
            .map(|(a, b)| op.apply(a, b))
            .collect(),
    ))
}

/// Indices of the rows where `column[i] op threshold` holds. NaN never passes.
pub fn matching_rows(
    op: CompareOp,
    column: &Column,
    threshold: f64,
) -> Result<Vec<usize>, ExecutionError> {
    let values = column.numeric_values()?;
    Ok(values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan() && op.test(**v, threshold))
        .map(|(i, _)| i)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_matters_for_sub_and_div() {
        let col = Column::int64("v", vec![2, 4]);
        let l = scalar_column(ArithmeticOp::Sub, 10.0, &col, "v").unwrap();
        let r = column_scalar(ArithmeticOp::Sub, &col, 10.0, "v").unwrap();
        assert_eq!(l.numeric_values().unwrap(), vec![8.0, 6.0]);
        assert_eq!(r.numeric_values().unwrap(), vec![-8.0, -6.0]);

        let l = scalar_column(ArithmeticOp::Div, 8.0, &col, "v").unwrap();
        assert_eq!(l.numeric_values().unwrap(), vec![4.0, 2.0]);
    }

    #[test]
    fn test_column_column_requires_equal_length() {
        let a = Column::float64("a", vec![1.0, 2.0]);
        let b = Column::float64("b", vec![1.0]);
        assert!(column_column(ArithmeticOp::Add, &a, &b, "x").is_err());

        let b = Column::int64("b", vec![3, 4]);
        let sum = column_column(ArithmeticOp::Add, &a, &b, "x").unwrap();
        assert_eq!(sum.name, "x");
        assert_eq!(sum.numeric_values().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_division_by_zero_is_ieee() {
        let zero = Column::int64("z", vec![0, 0]);
        let out = scalar_column(ArithmeticOp::Div, 1.0, &zero, "v").unwrap();
        let values = out.numeric_values().unwrap();
        assert!(values[0].is_infinite());

        let out = scalar_column(ArithmeticOp::Div, 0.0, &zero, "v").unwrap();
        assert!(out.numeric_values().unwrap()[0].is_nan());
    }

    #[test]
    fn test_matching_rows() {
        let col = Column::float64("v", vec![1.0, 5.0, f64::NAN, 10.0]);
        assert_eq!(matching_rows(CompareOp::Gte, &col, 5.0).unwrap(), vec![1, 3]);
        assert_eq!(matching_rows(CompareOp::Ne, &col, 5.0).unwrap(), vec![0, 3]);
        assert_eq!(matching_rows(CompareOp::Eq, &col, 1.0).unwrap(), vec![0]);
    }

    #[test]
    fn test_text_operand_is_type_error() {
        let col = Column::text("app", vec!["a"]);
        assert!(matches!(
            column_scalar(ArithmeticOp::Add, &col, 1.0, "x"),
            Err(ExecutionError::TypeError(_))
        ));
    }
}
