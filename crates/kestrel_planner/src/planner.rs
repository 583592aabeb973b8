//! Physical planner: turns an optimized metric expression into a
//! [`QueryStep`] tree.
//!
//! Comparisons against a metric are pushed into the metric's leaf query when
//! `enable_filter_pushdown` is set; otherwise they become a Filter step above
//! it. A metric carrying a time offset is planned as a relative-change
//! computation `(curr - base) / base`.

use kestrel_common::config::PlannerConfig;
use kestrel_common::datum::Datum;
use kestrel_common::error::PlanError;
use kestrel_common::types::{ArithmeticOp, CompareOp, QueryInterval, TimeOffset};
use kestrel_expr::metric::{MetricAggregateExpr, MetricPredicate, MetricQuery, Selector};
use kestrel_expr::normalize::and_optional;
use kestrel_expr::types::{BinaryOp, Expr};

use crate::plan::QueryStep;

/// Result column of the `curr - base` step of an offset plan.
pub const DIFF_COLUMN: &str = "diff";
/// Result column of an offset plan.
pub const DELTA_COLUMN: &str = "delta";

#[derive(Debug, Clone)]
pub struct PhysicalPlanner {
    config: PlannerConfig,
    interval: QueryInterval,
}

impl PhysicalPlanner {
    pub fn new(config: PlannerConfig, interval: QueryInterval) -> Self {
        Self { config, interval }
    }

    /// Plan `expr`. `condition` is ANDed into the filter of every leaf query.
    pub fn plan(&self, expr: &Expr, condition: Option<&Expr>) -> Result<QueryStep, PlanError> {
        if !self.interval.has_valid_step() {
            return Err(PlanError::InvalidInterval(format!("{:?}", self.interval)));
        }
        let step = self.visit(expr, condition)?;
        tracing::debug!(
            leaves = step.leaf_count(),
            scalar = step.is_scalar(),
            pushdown = self.config.enable_filter_pushdown,
            "physical plan built"
        );
        Ok(step)
    }

    fn visit(&self, expr: &Expr, condition: Option<&Expr>) -> Result<QueryStep, PlanError> {
        match expr {
            Expr::Literal(value) | Expr::ExpectedValue { value, offset: None } => {
                numeric_literal(value)
            }
            Expr::MetricAggregate(metric) => self.visit_metric(metric, condition),
            Expr::Binary { op, left, right } => {
                if let Some(cmp) = op.comparison() {
                    return self.visit_comparison(cmp, left, right, condition);
                }
                let arith = arithmetic_op(*op)?;
                let lhs = self.visit(left, condition)?;
                let rhs = self.visit(right, condition)?;
                Ok(QueryStep::arithmetic(arith, lhs, rhs))
            }
            other => Err(PlanError::UnsupportedExpression(other.to_string())),
        }
    }

    fn visit_metric(
        &self,
        metric: &MetricAggregateExpr,
        condition: Option<&Expr>,
    ) -> Result<QueryStep, PlanError> {
        if let Some(offset) = &metric.offset {
            let delta = self.plan_delta(metric, offset, condition);
            // The delta only exists after the join, so its comparison stays a Filter.
            return match &metric.predicate {
                Some(p) => Ok(QueryStep::filter(p.op, threshold(&p.expected)?, delta)),
                None => Ok(delta),
            };
        }

        let field = &metric.field;
        let mut query = self.leaf_query(metric, condition);
        query
            .selectors
            .push(Selector::new(field.name.clone(), field.to_expr()));
        query.predicate = metric.predicate.as_ref().map(|p| {
            Expr::compare(
                p.op,
                Expr::ident(field.name.clone()),
                Expr::Literal(p.expected.clone()),
            )
        });
        Ok(QueryStep::MetricAggregate { query })
    }

    /// `Div(Sub(curr, base, "diff", [field]), base, "delta", [field, offset])`
    fn plan_delta(
        &self,
        metric: &MetricAggregateExpr,
        offset: &TimeOffset,
        condition: Option<&Expr>,
    ) -> QueryStep {
        let field = &metric.field;
        // Force floating point so integer aggregates do not truncate the ratio.
        let value = Expr::binary(BinaryOp::Mul, field.to_expr(), Expr::literal(1.0));

        let mut curr = self.leaf_query(metric, condition);
        curr.selectors
            .push(Selector::new(field.name.clone(), value.clone()));

        let mut base = self.leaf_query(metric, condition);
        base.selectors.push(Selector::new(offset.text(), value));
        base.offset = Some(offset.clone());

        let curr = QueryStep::MetricAggregate { query: curr };
        // Both references to `base` resolve to a single fetch at execution.
        let base = QueryStep::MetricAggregate { query: base };
        let diff = QueryStep::arithmetic_named(
            ArithmeticOp::Sub,
            curr,
            base.clone(),
            DIFF_COLUMN,
            [field.name.clone()],
        );
        QueryStep::arithmetic_named(
            ArithmeticOp::Div,
            diff,
            base,
            DELTA_COLUMN,
            [field.name.clone(), offset.text().to_string()],
        )
    }

    fn leaf_query(&self, metric: &MetricAggregateExpr, condition: Option<&Expr>) -> MetricQuery {
        let mut query = MetricQuery::new(metric.data_source.clone(), self.interval);
        query.filter = and_optional(metric.filter.clone(), condition.cloned());
        query.group_by = metric.group_by.clone();
        query
    }

    fn visit_comparison(
        &self,
        op: CompareOp,
        left: &Expr,
        right: &Expr,
        condition: Option<&Expr>,
    ) -> Result<QueryStep, PlanError> {
        let (expected, offset) = match right {
            Expr::Literal(value) => (value, None),
            Expr::ExpectedValue { value, offset } => (value, offset.as_ref()),
            other => {
                return Err(PlanError::UnsupportedExpression(format!(
                    "comparison threshold must be a literal, got {}",
                    other
                )))
            }
        };
        let bound = threshold(expected)?;

        match left {
            Expr::MetricAggregate(metric) => {
                let mut metric = (**metric).clone();
                if let Some(offset) = offset {
                    match &metric.offset {
                        Some(existing) if existing != offset => {
                            return Err(PlanError::UnsupportedExpression(format!(
                                "metric offset {} conflicts with comparison offset {}",
                                existing, offset
                            )))
                        }
                        _ => metric.offset = Some(offset.clone()),
                    }
                }
                if self.config.enable_filter_pushdown && metric.predicate.is_none() {
                    metric.predicate = Some(MetricPredicate {
                        op,
                        expected: expected.clone(),
                    });
                    return self.visit_metric(&metric, condition);
                }
                let input = self.visit_metric(&metric, condition)?;
                Ok(QueryStep::filter(op, bound, input))
            }
            _ if offset.is_some() => Err(PlanError::UnsupportedExpression(format!(
                "offset comparison requires a metric on the left, got {}",
                left
            ))),
            _ => {
                let input = self.visit(left, condition)?;
                Ok(QueryStep::filter(op, bound, input))
            }
        }
    }
}

fn numeric_literal(value: &Datum) -> Result<QueryStep, PlanError> {
    match value {
        Datum::Int64(_) | Datum::Float64(_) => Ok(QueryStep::Literal {
            value: value.clone(),
        }),
        other => Err(PlanError::UnsupportedExpression(format!(
            "literal must be numeric, got {}",
            other
        ))),
    }
}

fn threshold(value: &Datum) -> Result<f64, PlanError> {
    value
        .as_f64()
        .ok_or_else(|| PlanError::NonNumericThreshold(value.to_string()))
}

fn arithmetic_op(op: BinaryOp) -> Result<ArithmeticOp, PlanError> {
    op.arithmetic().ok_or_else(|| PlanError::UnsupportedOperator {
        operator: op.symbol().to_string(),
        context: "arithmetic".to_string(),
    })
}
