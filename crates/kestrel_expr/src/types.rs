use serde::{Deserialize, Serialize};
use std::fmt;

use kestrel_common::datum::Datum;
use kestrel_common::types::{ArithmeticOp, CompareOp, TimeOffset};

use crate::metric::MetricAggregateExpr;

/// An already-parsed, already-optimized expression.
///
/// The same shape serves two interpreters: the physical planner walks the
/// metric-level tree (`MetricAggregate`, arithmetic, comparisons), the SQL
/// compiler walks the column-level trees found inside selectors and filters
/// (`Identifier`, `Function`, `Macro`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A literal value.
    Literal(Datum),
    /// A raw or output column reference.
    Identifier(String),
    /// A `{name}` macro, expanded during SQL compilation.
    Macro(String),
    /// Function call; aggregate functions are recognised by name.
    Function { name: String, args: Vec<Expr> },
    /// Binary operation (arithmetic, comparison or logical).
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Logical NOT.
    Not(Box<Expr>),
    /// Aggregated metric over one data source.
    MetricAggregate(Box<MetricAggregateExpr>),
    /// The right-hand side of an alert-style comparison: a threshold,
    /// optionally relative to the metric's value `offset` ago.
    ExpectedValue {
        value: Datum,
        offset: Option<TimeOffset>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn arithmetic(self) -> Option<ArithmeticOp> {
        match self {
            BinaryOp::Add => Some(ArithmeticOp::Add),
            BinaryOp::Sub => Some(ArithmeticOp::Sub),
            BinaryOp::Mul => Some(ArithmeticOp::Mul),
            BinaryOp::Div => Some(ArithmeticOp::Div),
            _ => None,
        }
    }

    pub fn comparison(self) -> Option<CompareOp> {
        match self {
            BinaryOp::Lt => Some(CompareOp::Lt),
            BinaryOp::Lte => Some(CompareOp::Lte),
            BinaryOp::Gt => Some(CompareOp::Gt),
            BinaryOp::Gte => Some(CompareOp::Gte),
            BinaryOp::Eq => Some(CompareOp::Eq),
            BinaryOp::Ne => Some(CompareOp::Ne),
            _ => None,
        }
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

impl From<ArithmeticOp> for BinaryOp {
    fn from(op: ArithmeticOp) -> Self {
        match op {
            ArithmeticOp::Add => BinaryOp::Add,
            ArithmeticOp::Sub => BinaryOp::Sub,
            ArithmeticOp::Mul => BinaryOp::Mul,
            ArithmeticOp::Div => BinaryOp::Div,
        }
    }
}

impl From<CompareOp> for BinaryOp {
    fn from(op: CompareOp) -> Self {
        match op {
            CompareOp::Lt => BinaryOp::Lt,
            CompareOp::Lte => BinaryOp::Lte,
            CompareOp::Gt => BinaryOp::Gt,
            CompareOp::Gte => BinaryOp::Gte,
            CompareOp::Eq => BinaryOp::Eq,
            CompareOp::Ne => BinaryOp::Ne,
        }
    }
}

/// Aggregate functions understood by the SQL compiler and the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    /// Value of the earliest row (by timestamp) in the bucket.
    First,
    /// Value of the most recent row (by timestamp) in the bucket.
    Last,
    /// Distinct count.
    Cardinality,
    /// Distinct values joined into one string.
    GroupConcat,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name.to_ascii_lowercase().as_str() {
            "sum" => AggregateFunction::Sum,
            "count" => AggregateFunction::Count,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            "avg" => AggregateFunction::Avg,
            "first" => AggregateFunction::First,
            "last" => AggregateFunction::Last,
            "cardinality" => AggregateFunction::Cardinality,
            "groupconcat" => AggregateFunction::GroupConcat,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
            AggregateFunction::Cardinality => "cardinality",
            AggregateFunction::GroupConcat => "groupConcat",
        }
    }

    /// Aggregators whose value depends on row order inside the bucket.
    pub fn is_positional(self) -> bool {
        matches!(self, AggregateFunction::First | AggregateFunction::Last)
    }
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Identifier(name.into())
    }

    pub fn literal(value: impl Into<Datum>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Self::binary(op.into(), left, right)
    }

    pub fn metric(metric: MetricAggregateExpr) -> Self {
        Expr::MetricAggregate(Box::new(metric))
    }

    /// If this is a call to a known aggregate function, return it.
    pub fn as_aggregate(&self) -> Option<(AggregateFunction, &[Expr])> {
        match self {
            Expr::Function { name, args } => {
                AggregateFunction::from_name(name).map(|f| (f, args.as_slice()))
            }
            _ => None,
        }
    }

    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            Expr::Identifier(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Datum::Text(s)) => write!(f, "'{}'", s),
            Expr::Literal(d) => write!(f, "{}", d),
            Expr::Identifier(name) => f.write_str(name),
            Expr::Macro(name) => write!(f, "{{{}}}", name),
            Expr::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Not(inner) => write!(f, "NOT {}", inner),
            Expr::MetricAggregate(m) => write!(f, "{}", m),
            Expr::ExpectedValue { value, offset } => match offset {
                Some(o) => write!(f, "{}[-{}]", value, o),
                None => write!(f, "{}", value),
            },
        }
    }
}
