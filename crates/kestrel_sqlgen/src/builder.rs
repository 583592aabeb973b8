//! SQL Statement Compiler.
//!
//! Compiles one leaf query (output selectors, raw filter, group-by columns,
//! interval) into a chain of SELECT stages:
//!
//! ```text
//! [window aggregation] -> aggregation -> [post aggregation] -> [outer filter]
//! ```
//!
//! Every aggregate call found in the selectors is registered once per
//! compilation in an [`AggregatorRegistry`]; the registry and the synthetic
//! name counters live on the per-call `Compilation`, never anywhere shared.

use std::collections::{HashMap, HashSet};

use kestrel_common::config::SqlConfig;
use kestrel_common::error::CompileError;
use kestrel_common::types::{QueryInterval, TimeOffset, TIMESTAMP_COLUMN};
use kestrel_expr::metric::{Limit, MetricQuery, OrderBy, Selector};
use kestrel_expr::normalize::{and_optional, referenced_identifiers, split_conjuncts};
use kestrel_expr::types::{AggregateFunction, BinaryOp, Expr};

use crate::ast::{
    FromSource, MacroValue, OrderByItem, SelectItem, SelectStatement, SqlExpr, StageKind,
};
use crate::dialect::SqlDialect;

/// Non-aggregate functions allowed in selectors and filters.
pub const SCALAR_FUNCTIONS: &[&str] = &["round", "abs", "floor", "ceil"];

pub const INTERVAL_MACRO: &str = "interval";
pub const INSTANCE_COUNT_MACRO: &str = "instanceCount";

/// One aggregate-function invocation and the column it is visible under.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregator {
    pub func: AggregateFunction,
    /// `None` for `count()`.
    pub arg: Option<SqlExpr>,
    pub alias: String,
    /// Computed by a window function in the window aggregation stage.
    pub windowed: bool,
}

/// Deduplicating aggregator registry, scoped to one compilation.
///
/// Two registrations are the same aggregator when they use the same function
/// over the same single column. Aggregators over computed arguments are never
/// merged.
#[derive(Debug, Default)]
struct AggregatorRegistry {
    aggregators: Vec<Aggregator>,
    index: HashMap<(AggregateFunction, String), usize>,
    next_var: usize,
}

impl AggregatorRegistry {
    fn fresh_alias(&mut self) -> String {
        let alias = format!("_var{}", self.next_var);
        self.next_var += 1;
        alias
    }

    /// Returns the alias the aggregator is visible under, which is the
    /// existing one if an equal aggregator was registered before.
    fn register(
        &mut self,
        func: AggregateFunction,
        arg: Option<SqlExpr>,
        windowed: bool,
        alias: Option<&str>,
    ) -> String {
        let key = match &arg {
            None => Some("*".to_string()),
            Some(SqlExpr::Column { table: None, name }) => Some(name.clone()),
            Some(_) => None,
        };
        if let Some(key) = &key {
            if let Some(&i) = self.index.get(&(func, key.clone())) {
                return self.aggregators[i].alias.clone();
            }
        }
        let alias = match alias {
            Some(a) => a.to_string(),
            None => self.fresh_alias(),
        };
        if let Some(key) = key {
            self.index.insert((func, key), self.aggregators.len());
        }
        self.aggregators.push(Aggregator {
            func,
            arg,
            alias: alias.clone(),
            windowed,
        });
        alias
    }
}

/// A compiled leaf query.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectPipeline {
    /// The outermost stage; inner stages hang off its FROM clause.
    pub statement: SelectStatement,
    /// Stage roles, innermost first.
    pub stages: Vec<StageKind>,
    pub aggregators: Vec<Aggregator>,
}

impl SelectPipeline {
    pub fn has_stage(&self, kind: StageKind) -> bool {
        self.stages.contains(&kind)
    }

    /// The statement playing `kind` in this pipeline.
    pub fn stage(&self, kind: StageKind) -> Option<&SelectStatement> {
        let pos = self.stages.iter().position(|k| *k == kind)?;
        let mut stmt = &self.statement;
        for _ in 0..(self.stages.len() - 1 - pos) {
            stmt = stmt.inner()?;
        }
        Some(stmt)
    }
}

/// Collects everything one leaf query needs and compiles it with [`build`].
///
/// `interval` is the window rows are read from; `offset` only moves the
/// bucket label forward so buckets of a look-back query line up with the
/// current ones.
///
/// [`build`]: SelectStatementBuilder::build
#[derive(Debug, Clone)]
pub struct SelectStatementBuilder<'d> {
    dialect: &'d dyn SqlDialect,
    table: String,
    timestamp_column: String,
    instance_column: String,
    fields: Vec<Selector>,
    filter: Option<Expr>,
    group_by: Vec<String>,
    interval: QueryInterval,
    offset: Option<TimeOffset>,
    order_by: Option<OrderBy>,
    limit: Option<Limit>,
}

impl<'d> SelectStatementBuilder<'d> {
    pub fn new(dialect: &'d dyn SqlDialect, table: impl Into<String>, interval: QueryInterval) -> Self {
        Self {
            dialect,
            table: table.into(),
            timestamp_column: "timestamp".to_string(),
            instance_column: "instanceName".to_string(),
            fields: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            interval,
            offset: None,
            order_by: None,
            limit: None,
        }
    }

    /// Builder for a data-source query. The window is the offset-shifted one.
    pub fn from_query(dialect: &'d dyn SqlDialect, query: &MetricQuery, config: &SqlConfig) -> Self {
        let mut builder = Self::new(dialect, query.data_source.clone(), query.effective_interval())
            .timestamp_column(config.timestamp_column.clone())
            .instance_column(config.instance_column.clone())
            .fields(query.selectors.clone())
            .group_by(query.group_by.clone());
        builder.filter = and_optional(query.filter.clone(), query.predicate.clone());
        builder.offset = query.offset.clone();
        builder.order_by = query.order_by.clone();
        builder.limit = query.limit;
        builder
    }

    pub fn timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = column.into();
        self
    }

    pub fn instance_column(mut self, column: impl Into<String>) -> Self {
        self.instance_column = column.into();
        self
    }

    pub fn fields(mut self, fields: Vec<Selector>) -> Self {
        self.fields = fields;
        self
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn group_by<I, S>(mut self, group_by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = group_by.into_iter().map(Into::into).collect();
        self
    }

    pub fn offset(mut self, offset: TimeOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(&self) -> Result<SelectPipeline, CompileError> {
        Compilation::new(self).run()
    }
}

/// State of one `build()` call.
struct Compilation<'a> {
    b: &'a SelectStatementBuilder<'a>,
    registry: AggregatorRegistry,
    next_table_alias: usize,
}

impl<'a> Compilation<'a> {
    fn new(b: &'a SelectStatementBuilder<'a>) -> Self {
        Self {
            b,
            registry: AggregatorRegistry::default(),
            next_table_alias: 0,
        }
    }

    fn run(mut self) -> Result<SelectPipeline, CompileError> {
        let b = self.b;
        if !b.interval.has_valid_step() {
            return Err(CompileError::InvalidInterval(format!("{:?}", b.interval)));
        }
        if b.fields.is_empty() {
            return Err(CompileError::InvalidExpression(
                "query has no output selectors".into(),
            ));
        }
        let mut outputs = HashSet::new();
        for field in &b.fields {
            if !outputs.insert(field.output.as_str()) {
                return Err(CompileError::InvalidExpression(format!(
                    "duplicate output column {}",
                    field.output
                )));
            }
        }

        // Top-level aggregate selectors claim their output name as alias first.
        let mut post_exprs: Vec<Option<SqlExpr>> = vec![None; b.fields.len()];
        let mut needs_post = false;
        for (slot, field) in post_exprs.iter_mut().zip(&b.fields) {
            if let Some(alias) = self.register_top_level(field)? {
                if alias != field.output {
                    needs_post = true;
                }
                *slot = Some(SqlExpr::column(alias));
            }
        }
        for (slot, field) in post_exprs.iter_mut().zip(&b.fields) {
            if slot.is_none() {
                needs_post = true;
                *slot = Some(self.lower_selector(&field.expr)?);
            }
        }
        let selectors: Vec<(String, SqlExpr)> = b
            .fields
            .iter()
            .zip(post_exprs)
            .filter_map(|(field, expr)| expr.map(|e| (field.output.clone(), e)))
            .collect();

        // Split the filter into raw-row and aggregated-output conjuncts.
        let mut raw = Vec::new();
        let mut elevated = Vec::new();
        if let Some(filter) = &b.filter {
            for conjunct in split_conjuncts(filter) {
                if let Some(agg) = find_aggregate(&conjunct) {
                    return Err(CompileError::InvalidExpression(format!(
                        "aggregate {} in filter; compare a selector output instead",
                        agg
                    )));
                }
                let lowered = self.lower_raw(&conjunct)?;
                if referenced_identifiers(&conjunct)
                    .iter()
                    .any(|id| outputs.contains(id.as_str()))
                {
                    elevated.push(lowered);
                } else {
                    raw.push(lowered.qualify(&b.table));
                }
            }
        }

        let ts = SqlExpr::column(b.timestamp_column.clone());
        let time_range = SqlExpr::and(
            SqlExpr::binary(BinaryOp::Gte, ts.clone(), SqlExpr::Timestamp(b.interval.start)),
            SqlExpr::binary(BinaryOp::Lt, ts.clone(), SqlExpr::Timestamp(b.interval.end)),
        );
        let mut innermost_where = Some(raw.into_iter().fold(time_range, SqlExpr::and));
        let bucket = b.interval.step.map(|step| SqlExpr::TimeBucket {
            timestamp: Box::new(ts.clone()),
            step,
            shift: b.offset.as_ref().map(TimeOffset::seconds).unwrap_or(0),
        });
        let group_cols: Vec<SqlExpr> = b
            .group_by
            .iter()
            .map(|g| SqlExpr::column(g.clone()))
            .collect();
        let aggregators = std::mem::take(&mut self.registry.aggregators);
        let mut stages = Vec::new();
        // Windowed aggregators whose output name is already taken by a
        // projected raw column; they travel under a synthetic name until the
        // aggregation stage.
        let mut window_names: HashMap<String, String> = HashMap::new();

        // Window aggregation stage.
        let window_stage = if aggregators.iter().any(|a| a.windowed) {
            let mut stmt = SelectStatement::new(FromSource::Table(b.table.clone()));
            stmt.select
                .extend(group_cols.iter().cloned().map(SelectItem::new));
            if let Some(bucket) = &bucket {
                stmt.select
                    .push(SelectItem::aliased(bucket.clone(), TIMESTAMP_COLUMN));
            }
            let mut projected: HashSet<String> = b.group_by.iter().cloned().collect();
            for agg in aggregators.iter().filter(|a| !a.windowed) {
                if let Some(arg) = &agg.arg {
                    arg.for_each_column(&mut |_: Option<&str>, name: &str| {
                        if projected.insert(name.to_string()) {
                            stmt.select.push(SelectItem::new(SqlExpr::column(name)));
                        }
                    });
                }
                if agg.func.is_positional() && projected.insert(b.timestamp_column.clone()) {
                    stmt.select.push(SelectItem::new(ts.clone()));
                }
            }
            let mut partition_by = group_cols.clone();
            partition_by.extend(bucket.clone());
            for agg in aggregators.iter().filter(|a| a.windowed) {
                if let Some(arg) = &agg.arg {
                    let name = if projected.contains(&agg.alias) || agg.alias == TIMESTAMP_COLUMN {
                        let fresh = self.registry.fresh_alias();
                        window_names.insert(agg.alias.clone(), fresh.clone());
                        fresh
                    } else {
                        agg.alias.clone()
                    };
                    stmt.select.push(SelectItem::aliased(
                        SqlExpr::Window {
                            func: agg.func,
                            arg: Box::new(arg.clone()),
                            partition_by: partition_by.clone(),
                            order_key: Box::new(ts.clone()),
                        },
                        name,
                    ));
                }
            }
            stmt.where_clause = innermost_where.take();
            stages.push(StageKind::WindowAggregation);
            Some(stmt)
        } else {
            None
        };

        // Aggregation stage.
        let threaded = window_stage.is_some();
        let from = match window_stage {
            Some(stmt) => self.subquery(stmt),
            None => FromSource::Table(b.table.clone()),
        };
        let mut agg_stmt = SelectStatement::new(from);
        agg_stmt.where_clause = innermost_where.take();
        agg_stmt
            .select
            .extend(group_cols.iter().cloned().map(SelectItem::new));
        agg_stmt.group_by.extend(group_cols.iter().cloned());
        if let Some(bucket) = &bucket {
            if threaded {
                let label = SqlExpr::column(TIMESTAMP_COLUMN);
                agg_stmt.select.push(SelectItem::new(label.clone()));
                agg_stmt.group_by.push(label);
            } else {
                agg_stmt
                    .select
                    .push(SelectItem::aliased(bucket.clone(), TIMESTAMP_COLUMN));
                agg_stmt.group_by.push(bucket.clone());
            }
        }
        let mut aggregate_exprs: HashMap<String, SqlExpr> = HashMap::new();
        for agg in &aggregators {
            if agg.windowed {
                match window_names.get(&agg.alias) {
                    Some(name) => {
                        let column = SqlExpr::column(name.clone());
                        aggregate_exprs.insert(agg.alias.clone(), column.clone());
                        agg_stmt
                            .select
                            .push(SelectItem::aliased(column.clone(), agg.alias.clone()));
                        agg_stmt.group_by.push(column);
                    }
                    None => {
                        let column = SqlExpr::column(agg.alias.clone());
                        agg_stmt.select.push(SelectItem::new(column.clone()));
                        agg_stmt.group_by.push(column);
                    }
                }
            } else {
                let expr = SqlExpr::Aggregate {
                    func: agg.func,
                    arg: agg.arg.clone().map(Box::new),
                    order_key: agg.func.is_positional().then(|| Box::new(ts.clone())),
                };
                aggregate_exprs.insert(agg.alias.clone(), expr.clone());
                agg_stmt
                    .select
                    .push(SelectItem::aliased(expr, agg.alias.clone()));
            }
        }
        stages.push(StageKind::Aggregation);

        let mut elevated = elevated.into_iter().reduce(SqlExpr::and);
        if !agg_stmt.group_by.is_empty() {
            if let Some(predicate) = elevated.take() {
                let post_map: HashMap<&str, &SqlExpr> =
                    selectors.iter().map(|(o, e)| (o.as_str(), e)).collect();
                let having = predicate
                    .substitute_columns(&|name: &str| post_map.get(name).map(|e| (*e).clone()))
                    .substitute_columns(&|name: &str| aggregate_exprs.get(name).cloned());
                agg_stmt.having = Some(having);
            }
        }

        // Post aggregation stage.
        let mut current = agg_stmt;
        if needs_post {
            let mut post = SelectStatement::new(self.subquery(current));
            post.select
                .extend(group_cols.iter().cloned().map(SelectItem::new));
            if bucket.is_some() {
                post.select
                    .push(SelectItem::new(SqlExpr::column(TIMESTAMP_COLUMN)));
            }
            for (output, expr) in &selectors {
                post.select
                    .push(SelectItem::aliased(expr.clone(), output.clone()));
            }
            current = post;
            stages.push(StageKind::PostAggregation);
        }

        // Predicates on outputs of an ungrouped query.
        if let Some(predicate) = elevated {
            let inner_names: HashSet<String> = current
                .inner()
                .map(|s| s.output_names().into_iter().collect())
                .unwrap_or_default();
            let mut uses_alias = false;
            predicate.for_each_column(&mut |_: Option<&str>, name: &str| {
                if !inner_names.contains(name) {
                    uses_alias = true;
                }
            });
            let wrap = !needs_post || (uses_alias && !self.b.dialect.allow_alias_in_where());
            if wrap {
                let mut outer = SelectStatement::new(self.subquery(current));
                outer.select.push(SelectItem::new(SqlExpr::Star));
                outer.where_clause = Some(predicate);
                current = outer;
                stages.push(StageKind::OuterFilter);
            } else {
                current.where_clause = Some(predicate);
            }
        }

        if let Some(order_by) = &b.order_by {
            current.order_by.push(OrderByItem {
                expr: SqlExpr::column(order_by.column.clone()),
                ascending: order_by.ascending,
            });
        }
        current.limit = b.limit;

        tracing::debug!(
            table = %b.table,
            dialect = b.dialect.name(),
            stages = ?stages,
            aggregators = aggregators.len(),
            "compiled select pipeline"
        );
        Ok(SelectPipeline {
            statement: current,
            stages,
            aggregators,
        })
    }

    fn subquery(&mut self, stmt: SelectStatement) -> FromSource {
        let alias = if self.b.dialect.requires_subquery_alias() {
            let alias = format!("tbl{}", self.next_table_alias);
            self.next_table_alias += 1;
            Some(alias)
        } else {
            None
        };
        FromSource::Subquery {
            query: Box::new(stmt),
            alias,
        }
    }

    /// Registers a selector that is exactly one aggregate call.
    fn register_top_level(&mut self, field: &Selector) -> Result<Option<String>, CompileError> {
        match &field.expr {
            Expr::Function { name, args } => match AggregateFunction::from_name(name) {
                Some(func) => self
                    .register_aggregate(func, args, Some(&field.output))
                    .map(Some),
                None => Ok(None),
            },
            Expr::Macro(name) if name == INSTANCE_COUNT_MACRO => {
                Ok(Some(self.register_instance_count(Some(&field.output))))
            }
            _ => Ok(None),
        }
    }

    fn register_aggregate(
        &mut self,
        func: AggregateFunction,
        args: &[Expr],
        alias: Option<&str>,
    ) -> Result<String, CompileError> {
        let arg = match (func, args) {
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
                })
            }
        };
        if let Some(inner) = arg.and_then(find_aggregate) {
            return Err(CompileError::NestedAggregator {
                outer: func.name().to_string(),
                inner,
            });
        }
        let windowed = self.b.dialect.use_window_function(func);
        if windowed && !matches!(arg, Some(Expr::Identifier(_))) {
            return Err(CompileError::IdentifierRequired {
                function: func.name().to_string(),
                got: arg.map(|a| a.to_string()).unwrap_or_else(|| "()".to_string()),
            });
        }
        let arg = arg.map(|a| self.lower_raw(a)).transpose()?;
        Ok(self.registry.register(func, arg, windowed, alias))
    }

    fn register_instance_count(&mut self, alias: Option<&str>) -> String {
        let func = AggregateFunction::Cardinality;
        let arg = SqlExpr::column(self.b.instance_column.clone());
        let windowed = self.b.dialect.use_window_function(func);
        self.registry.register(func, Some(arg), windowed, alias)
    }

    /// Lower a selector expression, replacing aggregate calls by their alias.
    fn lower_selector(&mut self, expr: &Expr) -> Result<SqlExpr, CompileError> {
        match expr {
            Expr::Literal(d) => Ok(SqlExpr::Literal(d.clone())),
            Expr::Identifier(name) => {
                if self.b.group_by.iter().any(|g| g == name) || name == TIMESTAMP_COLUMN {
                    Ok(SqlExpr::column(name.clone()))
                } else {
                    Err(CompileError::InvalidExpression(format!(
                        "column {} must be aggregated or listed in group by",
                        name
                    )))
                }
            }
            Expr::Macro(name) if name == INSTANCE_COUNT_MACRO => {
                Ok(SqlExpr::column(self.register_instance_count(None)))
            }
            Expr::Macro(name) => self.lower_macro(name),
            Expr::Function { name, args } => match AggregateFunction::from_name(name) {
                Some(func) => Ok(SqlExpr::column(self.register_aggregate(func, args, None)?)),
                None => {
                    let name = scalar_function_name(name)?;
                    let args = args
                        .iter()
                        .map(|a| self.lower_selector(a))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(SqlExpr::Function { name, args })
                }
            },
            Expr::Binary { op, left, right } => {
                if op.arithmetic().is_none() {
                    return Err(CompileError::UnsupportedOperator(op.symbol().to_string()));
                }
                Ok(SqlExpr::binary(
                    *op,
                    self.lower_selector(left)?,
                    self.lower_selector(right)?,
                ))
            }
            other => Err(CompileError::InvalidExpression(format!(
                "{} is not a column expression",
                other
            ))),
        }
    }

    /// Lower a row-level expression: aggregate arguments and filters.
    fn lower_raw(&self, expr: &Expr) -> Result<SqlExpr, CompileError> {
        match expr {
            Expr::Literal(d) => Ok(SqlExpr::Literal(d.clone())),
            Expr::Identifier(name) => Ok(SqlExpr::column(name.clone())),
            Expr::Macro(name) if name == INSTANCE_COUNT_MACRO => Err(
                CompileError::InvalidExpression(format!("{{{}}} is an aggregate", name)),
            ),
            Expr::Macro(name) => self.lower_macro(name),
            Expr::Function { name, args } => {
                if AggregateFunction::from_name(name).is_some() {
                    return Err(CompileError::InvalidExpression(format!(
                        "aggregate {} is not allowed here",
                        expr
                    )));
                }
                let name = scalar_function_name(name)?;
                let args = args
                    .iter()
                    .map(|a| self.lower_raw(a))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlExpr::Function { name, args })
            }
            Expr::Binary { op, left, right } => {
                if *op == BinaryOp::Mod {
                    return Err(CompileError::UnsupportedOperator(op.symbol().to_string()));
                }
                Ok(SqlExpr::binary(*op, self.lower_raw(left)?, self.lower_raw(right)?))
            }
            Expr::Not(inner) => Ok(SqlExpr::Not(Box::new(self.lower_raw(inner)?))),
            other => Err(CompileError::InvalidExpression(format!(
                "{} is not a column expression",
                other
            ))),
        }
    }

    fn lower_macro(&self, name: &str) -> Result<SqlExpr, CompileError> {
        if name == INTERVAL_MACRO {
            Ok(SqlExpr::Macro(MacroValue::Interval(
                self.b.interval.bucket_length(),
            )))
        } else {
            Err(CompileError::UnknownMacro(name.to_string()))
        }
    }
}

fn scalar_function_name(name: &str) -> Result<String, CompileError> {
    SCALAR_FUNCTIONS
        .iter()
        .find(|f| f.eq_ignore_ascii_case(name))
        .map(|f| f.to_string())
        .ok_or_else(|| CompileError::UnknownFunction(name.to_string()))
}

/// The first aggregate call inside `expr`, rendered.
fn find_aggregate(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Function { name, args } => {
            if AggregateFunction::from_name(name).is_some() {
                Some(expr.to_string())
            } else {
                args.iter().find_map(find_aggregate)
            }
        }
        Expr::Macro(name) if name == INSTANCE_COUNT_MACRO => Some(expr.to_string()),
        Expr::Binary { left, right, .. } => find_aggregate(left).or_else(|| find_aggregate(right)),
        Expr::Not(inner) => find_aggregate(inner),
        _ => None,
    }
}
