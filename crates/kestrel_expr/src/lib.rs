pub mod metric;
pub mod normalize;
pub mod types;
#[cfg(test)]
mod tests;

pub use metric::{
    Limit, MetricAggregateExpr, MetricField, MetricPredicate, MetricQuery, OrderBy, Selector,
};
pub use types::{AggregateFunction, BinaryOp, Expr};
