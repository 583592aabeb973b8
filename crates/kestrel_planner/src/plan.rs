use std::fmt::Write as _;

use kestrel_common::datum::Datum;
use kestrel_common::types::{ArithmeticOp, CompareOp};
use kestrel_expr::metric::MetricQuery;

/// Default name of an arithmetic step's result column.
pub const VALUE_COLUMN: &str = "value";

/// Physical query plan: a tree of steps the executor evaluates bottom-up.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStep {
    /// Single-row scalar holding a literal value.
    Literal { value: Datum },
    /// Leaf: one aggregate query against a data source.
    MetricAggregate { query: MetricQuery },
    /// Binary arithmetic over the first value column of each side.
    Arithmetic {
        op: ArithmeticOp,
        lhs: Box<QueryStep>,
        rhs: Box<QueryStep>,
        /// Name of the computed column.
        result_column: String,
        /// Input columns carried into the output alongside the result.
        retained_columns: Vec<String>,
    },
    /// Keeps the rows whose first value column passes `value op threshold`.
    Filter {
        op: CompareOp,
        threshold: f64,
        input: Box<QueryStep>,
    },
}

impl QueryStep {
    pub fn arithmetic(op: ArithmeticOp, lhs: QueryStep, rhs: QueryStep) -> Self {
        QueryStep::Arithmetic {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            result_column: VALUE_COLUMN.to_string(),
            retained_columns: Vec::new(),
        }
    }

    pub fn arithmetic_named<I, S>(
        op: ArithmeticOp,
        lhs: QueryStep,
        rhs: QueryStep,
        result_column: impl Into<String>,
        retained_columns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryStep::Arithmetic {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            result_column: result_column.into(),
            retained_columns: retained_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn filter(op: CompareOp, threshold: f64, input: QueryStep) -> Self {
        QueryStep::Filter {
            op,
            threshold,
            input: Box::new(input),
        }
    }

    /// Whether this step yields a single-row, keyless result.
    pub fn is_scalar(&self) -> bool {
        match self {
            QueryStep::Literal { .. } => true,
            QueryStep::MetricAggregate { query } => query.is_scalar(),
            QueryStep::Arithmetic { lhs, rhs, .. } => lhs.is_scalar() && rhs.is_scalar(),
            QueryStep::Filter { input, .. } => input.is_scalar(),
        }
    }

    /// Number of leaf queries this plan issues.
    pub fn leaf_count(&self) -> usize {
        match self {
            QueryStep::Literal { .. } => 0,
            QueryStep::MetricAggregate { .. } => 1,
            QueryStep::Arithmetic { lhs, rhs, .. } => lhs.leaf_count() + rhs.leaf_count(),
            QueryStep::Filter { input, .. } => input.leaf_count(),
        }
    }

    /// Indented one-line-per-step rendering of the plan tree.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match self {
            QueryStep::Literal { value } => {
                let _ = writeln!(out, "{}Literal({})", pad, value);
            }
            QueryStep::MetricAggregate { query } => {
                let selectors: Vec<String> = query
                    .selectors
                    .iter()
                    .map(|s| format!("{} = {}", s.output, s.expr))
                    .collect();
                let _ = write!(
                    out,
                    "{}MetricAggregate({}: {}",
                    pad,
                    query.data_source,
                    selectors.join(", ")
                );
                if !query.group_by.is_empty() {
                    let _ = write!(out, " by [{}]", query.group_by.join(", "));
                }
                if let Some(filter) = &query.filter {
                    let _ = write!(out, " where {}", filter);
                }
                if let Some(offset) = &query.offset {
                    let _ = write!(out, " offset {}", offset);
                }
                if let Some(predicate) = &query.predicate {
                    let _ = write!(out, " having {}", predicate);
                }
                let _ = writeln!(out, ")");
            }
            QueryStep::Arithmetic {
                op,
                lhs,
                rhs,
                result_column,
                retained_columns,
            } => {
                let _ = write!(out, "{}Arithmetic({} -> {}", pad, op, result_column);
                if !retained_columns.is_empty() {
                    let _ = write!(out, ", retain [{}]", retained_columns.join(", "));
                }
                let _ = writeln!(out, ")");
                lhs.explain_into(out, depth + 1);
                rhs.explain_into(out, depth + 1);
            }
            QueryStep::Filter {
                op,
                threshold,
                input,
            } => {
                let _ = writeln!(out, "{}Filter({} {})", pad, op, threshold);
                input.explain_into(out, depth + 1);
            }
        }
    }
}
