use serde::{Deserialize, Serialize};
use std::fmt;

use kestrel_common::datum::Datum;
use kestrel_common::types::{CompareOp, QueryInterval, TimeOffset};

use crate::types::Expr;

/// `aggregator(field)`, e.g. `sum(errorCount)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricField {
    pub name: String,
    pub aggregator: String,
}

impl MetricField {
    pub fn new(aggregator: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aggregator: aggregator.into(),
        }
    }

    /// The aggregate call over the raw column.
    pub fn to_expr(&self) -> Expr {
        Expr::call(self.aggregator.clone(), vec![Expr::ident(self.name.clone())])
    }
}

/// A comparison attached to a metric by predicate pushdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPredicate {
    pub op: CompareOp,
    pub expected: Datum,
}

/// The MetricAggregate node of the expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregateExpr {
    pub data_source: String,
    /// Raw-row filter written in the expression itself.
    pub filter: Option<Expr>,
    pub group_by: Vec<String>,
    pub field: MetricField,
    pub offset: Option<TimeOffset>,
    pub predicate: Option<MetricPredicate>,
}

impl MetricAggregateExpr {
    pub fn new(data_source: impl Into<String>, field: MetricField) -> Self {
        Self {
            data_source: data_source.into(),
            filter: None,
            group_by: Vec::new(),
            field,
            offset: None,
            predicate: None,
        }
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_group_by<I, S>(mut self, group_by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = group_by.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_offset(mut self, offset: TimeOffset) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for MetricAggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}.{})",
            self.field.aggregator, self.data_source, self.field.name
        )?;
        if let Some(filter) = &self.filter {
            write!(f, "{{{}}}", filter)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " by ({})", self.group_by.join(", "))?;
        }
        if let Some(offset) = &self.offset {
            write!(f, "[-{}]", offset)?;
        }
        if let Some(p) = &self.predicate {
            write!(f, " {} {}", p.op.symbol(), p.expected)?;
        }
        Ok(())
    }
}

/// One output column of a leaf query: `expr AS output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub output: String,
    pub expr: Expr,
}

impl Selector {
    pub fn new(output: impl Into<String>, expr: Expr) -> Self {
        Self {
            output: output.into(),
            expr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub limit: usize,
    pub offset: usize,
}

/// One group-by / filter / interval aggregate query against a data source.
/// This is what a MetricAggregate step hands to its data-source client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub data_source: String,
    pub selectors: Vec<Selector>,
    /// Raw-row filter.
    pub filter: Option<Expr>,
    pub group_by: Vec<String>,
    /// The window as requested; an `offset` moves it back when executed.
    pub interval: QueryInterval,
    pub offset: Option<TimeOffset>,
    /// Predicate over selector outputs, evaluated after aggregation.
    pub predicate: Option<Expr>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<Limit>,
}

impl MetricQuery {
    pub fn new(data_source: impl Into<String>, interval: QueryInterval) -> Self {
        Self {
            data_source: data_source.into(),
            selectors: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            interval,
            offset: None,
            predicate: None,
            order_by: None,
            limit: None,
        }
    }

    /// The window rows are actually read from.
    pub fn effective_interval(&self) -> QueryInterval {
        match &self.offset {
            Some(offset) => self.interval.shifted_back(offset),
            None => self.interval,
        }
    }

    /// A leaf result is scalar when nothing splits it into series or buckets.
    pub fn is_scalar(&self) -> bool {
        self.group_by.is_empty() && !self.interval.is_windowed()
    }
}
