use std::sync::Arc;
use std::time::Instant;

use kestrel_common::config::QueryConfig;
use kestrel_common::error::KestrelResult;
use kestrel_common::types::QueryInterval;
use kestrel_expr::types::Expr;
use kestrel_observability::record_query_metrics;
use kestrel_planner::{PhysicalPlanner, QueryStep};

use crate::executor::Executor;
use crate::result::IntermediateQueryResult;
use crate::source::DataSourceClient;

/// Entry point for callers: plans an expression and evaluates it.
pub struct QueryEngine {
    config: QueryConfig,
    executor: Executor,
}

impl QueryEngine {
    pub fn new(config: QueryConfig, source: Arc<dyn DataSourceClient>) -> Self {
        Self {
            config,
            executor: Executor::new(source),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn plan(
        &self,
        expr: &Expr,
        interval: QueryInterval,
        condition: Option<&Expr>,
    ) -> KestrelResult<QueryStep> {
        let planner = PhysicalPlanner::new(self.config.planner.clone(), interval);
        Ok(planner.plan(expr, condition)?)
    }

    pub fn explain(
        &self,
        expr: &Expr,
        interval: QueryInterval,
        condition: Option<&Expr>,
    ) -> KestrelResult<String> {
        Ok(self.plan(expr, interval, condition)?.explain())
    }

    /// Plan and execute `expr` over `interval`. `condition` is a raw-row
    /// filter ANDed into every leaf query.
    pub async fn evaluate(
        &self,
        expr: &Expr,
        interval: QueryInterval,
        condition: Option<&Expr>,
    ) -> KestrelResult<IntermediateQueryResult> {
        let started = Instant::now();
        let step = self.plan(expr, interval, condition)?;
        let query_type = if step.is_scalar() { "scalar" } else { "vector" };
        let outcome = self.executor.execute(&step).await;

        let elapsed = started.elapsed();
        record_query_metrics(elapsed.as_micros() as u64, query_type, outcome.is_ok());
        let threshold = self.config.executor.slow_query_threshold_ms;
        if threshold > 0 && elapsed.as_millis() >= u128::from(threshold) {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                leaves = step.leaf_count(),
                expr = %expr,
                "slow metric query"
            );
        }
        match &outcome {
            Ok(result) => tracing::debug!(rows = result.row_count(), query_type, "query done"),
            Err(e) => tracing::debug!(error = %e, query_type, "query failed"),
        }
        Ok(outcome?)
    }
}
