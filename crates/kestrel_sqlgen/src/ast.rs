//! SQL statement AST produced by the statement compiler and consumed by the
//! text generator.

use kestrel_common::datum::Datum;
use kestrel_expr::metric::Limit;
use kestrel_expr::types::{AggregateFunction, BinaryOp};

/// A dialect-neutral SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// Column reference, optionally qualified with its source table.
    Column { table: Option<String>, name: String },
    Literal(Datum),
    Binary {
        op: BinaryOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Not(Box<SqlExpr>),
    /// Plain scalar function, rendered verbatim.
    Function { name: String, args: Vec<SqlExpr> },
    /// Aggregate call in a GROUP BY stage. `order_key` is the timestamp
    /// column for positional aggregators.
    Aggregate {
        func: AggregateFunction,
        arg: Option<Box<SqlExpr>>,
        order_key: Option<Box<SqlExpr>>,
    },
    /// Positional aggregator computed as a window function.
    Window {
        func: AggregateFunction,
        arg: Box<SqlExpr>,
        partition_by: Vec<SqlExpr>,
        order_key: Box<SqlExpr>,
    },
    /// `floor(ts / step) * step`, moved forward by `shift` seconds.
    TimeBucket {
        timestamp: Box<SqlExpr>,
        step: i64,
        shift: i64,
    },
    /// Epoch seconds rendered as the dialect's timestamp literal.
    Timestamp(i64),
    Macro(MacroValue),
    /// `*`
    Star,
}

/// Macros resolved at compile time, rendered by the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroValue {
    /// `{interval}`: seconds per output row.
    Interval(i64),
}

impl SqlExpr {
    pub fn column(name: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn binary(op: BinaryOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: SqlExpr, right: SqlExpr) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    pub fn column_name(&self) -> Option<&str> {
        match self {
            SqlExpr::Column { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Visit every column reference in this expression.
    pub fn for_each_column(&self, f: &mut dyn FnMut(Option<&str>, &str)) {
        match self {
            SqlExpr::Column { table, name } => f(table.as_deref(), name),
            SqlExpr::Binary { left, right, .. } => {
                left.for_each_column(f);
                right.for_each_column(f);
            }
            SqlExpr::Not(inner) => inner.for_each_column(f),
            SqlExpr::Function { args, .. } => {
                for arg in args {
                    arg.for_each_column(f);
                }
            }
            SqlExpr::Aggregate { arg, order_key, .. } => {
                if let Some(arg) = arg {
                    arg.for_each_column(f);
                }
                if let Some(key) = order_key {
                    key.for_each_column(f);
                }
            }
            SqlExpr::Window {
                arg,
                partition_by,
                order_key,
                ..
            } => {
                arg.for_each_column(f);
                for p in partition_by {
                    p.for_each_column(f);
                }
                order_key.for_each_column(f);
            }
            SqlExpr::TimeBucket { timestamp, .. } => timestamp.for_each_column(f),
            SqlExpr::Literal(_) | SqlExpr::Timestamp(_) | SqlExpr::Macro(_) | SqlExpr::Star => {}
        }
    }

    /// Replace unqualified column references for which `f` returns a substitute.
    pub fn substitute_columns(&self, f: &dyn Fn(&str) -> Option<SqlExpr>) -> SqlExpr {
        match self {
            SqlExpr::Column { table: None, name } => f(name).unwrap_or_else(|| self.clone()),
            SqlExpr::Binary { op, left, right } => SqlExpr::Binary {
                op: *op,
                left: Box::new(left.substitute_columns(f)),
                right: Box::new(right.substitute_columns(f)),
            },
            SqlExpr::Not(inner) => SqlExpr::Not(Box::new(inner.substitute_columns(f))),
            SqlExpr::Function { name, args } => SqlExpr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.substitute_columns(f)).collect(),
            },
            other => other.clone(),
        }
    }

    /// Qualify every unqualified column with `table`.
    pub fn qualify(&self, table: &str) -> SqlExpr {
        match self {
            SqlExpr::Column { table: None, name } => SqlExpr::qualified(table, name.clone()),
            SqlExpr::Binary { op, left, right } => SqlExpr::Binary {
                op: *op,
                left: Box::new(left.qualify(table)),
                right: Box::new(right.qualify(table)),
            },
            SqlExpr::Not(inner) => SqlExpr::Not(Box::new(inner.qualify(table))),
            SqlExpr::Function { name, args } => SqlExpr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.qualify(table)).collect(),
            },
            other => other.clone(),
        }
    }
}

/// `expr [AS alias]`
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: SqlExpr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: SqlExpr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// Name this item is visible under in the next stage.
    pub fn output_name(&self) -> Option<&str> {
        self.alias.as_deref().or_else(|| self.expr.column_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    Table(String),
    Subquery {
        query: Box<SelectStatement>,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: SqlExpr,
    pub ascending: bool,
}

/// One SELECT stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub select: Vec<SelectItem>,
    pub from: FromSource,
    pub where_clause: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<Limit>,
}

impl SelectStatement {
    pub fn new(from: FromSource) -> Self {
        Self {
            select: Vec::new(),
            from,
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Names visible to a stage selecting from this one.
    pub fn output_names(&self) -> Vec<String> {
        self.select
            .iter()
            .filter_map(|item| item.output_name().map(str::to_string))
            .collect()
    }

    /// Nesting depth: 1 for a statement reading a table directly.
    pub fn depth(&self) -> usize {
        match &self.from {
            FromSource::Table(_) => 1,
            FromSource::Subquery { query, .. } => 1 + query.depth(),
        }
    }

    /// The statement this one reads from, if it reads a subquery.
    pub fn inner(&self) -> Option<&SelectStatement> {
        match &self.from {
            FromSource::Subquery { query, .. } => Some(query),
            FromSource::Table(_) => None,
        }
    }
}

/// Which role a stage plays in a compiled pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    WindowAggregation,
    Aggregation,
    PostAggregation,
    /// `SELECT * FROM (...) WHERE` wrapper for predicates on SELECT aliases.
    OuterFilter,
}
