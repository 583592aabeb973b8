//! SQL dialect capabilities.
//!
//! The compiler asks a dialect what it can express (window functions for
//! positional aggregators, aliases in WHERE, subquery aliases) and the text
//! generator delegates quoting, time bucketing, timestamp literals, macros and
//! the non-portable aggregate renderings to it.

use std::fmt;

use chrono::DateTime;
use kestrel_common::config::DialectKind;
use kestrel_expr::types::AggregateFunction;

use crate::ast::MacroValue;

pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Whether `func` has no plain GROUP BY form and must be computed with a
    /// window function in a dedicated stage.
    fn use_window_function(&self, func: AggregateFunction) -> bool {
        func.is_positional()
    }

    /// Whether a SELECT alias may be referenced in the same statement's WHERE.
    fn allow_alias_in_where(&self) -> bool {
        false
    }

    /// Whether a FROM subquery must be given an alias.
    fn requires_subquery_alias(&self) -> bool {
        true
    }

    /// `floor(ts / step) * step` in epoch seconds.
    fn time_bucket(&self, timestamp_sql: &str, step: i64) -> String;

    /// Epoch seconds as a literal comparable with the timestamp column.
    fn timestamp_literal(&self, epoch_secs: i64) -> String;

    /// Render a GROUP BY aggregate. `arg` is `None` for `count()`.
    fn render_aggregate(
        &self,
        func: AggregateFunction,
        arg: Option<&str>,
        order_key: Option<&str>,
    ) -> String {
        portable_aggregate(func, arg, order_key)
    }

    /// Render a positional aggregator as a window function.
    fn render_window(
        &self,
        func: AggregateFunction,
        arg: &str,
        partition_by: &[String],
        order_key: &str,
    ) -> String {
        let direction = if matches!(func, AggregateFunction::Last) {
            "DESC"
        } else {
            "ASC"
        };
        if partition_by.is_empty() {
            format!("FIRST_VALUE({}) OVER (ORDER BY {} {})", arg, order_key, direction)
        } else {
            format!(
                "FIRST_VALUE({}) OVER (PARTITION BY {} ORDER BY {} {})",
                arg,
                partition_by.join(", "),
                order_key,
                direction
            )
        }
    }

    fn render_macro(&self, value: &MacroValue) -> String {
        match value {
            MacroValue::Interval(secs) => secs.to_string(),
        }
    }
}

/// Build the dialect selected in configuration.
pub fn dialect_for(kind: DialectKind) -> Box<dyn SqlDialect> {
    match kind {
        DialectKind::ClickHouse => Box::new(ClickHouseDialect),
        DialectKind::H2 => Box::new(H2Dialect),
        DialectKind::MySql => Box::new(MySqlDialect),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClickHouseDialect;

impl SqlDialect for ClickHouseDialect {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn use_window_function(&self, _func: AggregateFunction) -> bool {
        false
    }

    fn allow_alias_in_where(&self) -> bool {
        true
    }

    fn requires_subquery_alias(&self) -> bool {
        false
    }

    fn time_bucket(&self, timestamp_sql: &str, step: i64) -> String {
        format!("floor(toUnixTimestamp({}) / {}) * {}", timestamp_sql, step, step)
    }

    fn timestamp_literal(&self, epoch_secs: i64) -> String {
        format!("fromUnixTimestamp({})", epoch_secs)
    }

    fn render_aggregate(
        &self,
        func: AggregateFunction,
        arg: Option<&str>,
        order_key: Option<&str>,
    ) -> String {
        let a = arg.unwrap_or("");
        match func {
            AggregateFunction::Cardinality => format!("uniqExact({})", a),
            AggregateFunction::GroupConcat => {
                format!("arrayStringConcat(groupUniqArray({}), ',')", a)
            }
            AggregateFunction::First => match order_key {
                Some(ts) => format!("argMin({}, {})", a, ts),
                None => format!("any({})", a),
            },
            AggregateFunction::Last => match order_key {
                Some(ts) => format!("argMax({}, {})", a, ts),
                None => format!("anyLast({})", a),
            },
            _ => portable_aggregate(func, arg, order_key),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct H2Dialect;

impl SqlDialect for H2Dialect {
    fn name(&self) -> &'static str {
        "h2"
    }

    fn time_bucket(&self, timestamp_sql: &str, step: i64) -> String {
        format!(
            "FLOOR(DATEDIFF('SECOND', TIMESTAMP '1970-01-01 00:00:00', {}) / {}) * {}",
            timestamp_sql, step, step
        )
    }

    fn timestamp_literal(&self, epoch_secs: i64) -> String {
        match DateTime::from_timestamp(epoch_secs, 0) {
            Some(dt) => format!("TIMESTAMP '{}'", dt.format("%Y-%m-%d %H:%M:%S")),
            None => format!("DATEADD('SECOND', {}, TIMESTAMP '1970-01-01 00:00:00')", epoch_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn time_bucket(&self, timestamp_sql: &str, step: i64) -> String {
        format!("FLOOR(UNIX_TIMESTAMP({}) / {}) * {}", timestamp_sql, step, step)
    }

    fn timestamp_literal(&self, epoch_secs: i64) -> String {
        format!("FROM_UNIXTIME({})", epoch_secs)
    }
}

/// Aggregate rendering shared by every dialect unless overridden.
pub fn portable_aggregate(
    func: AggregateFunction,
    arg: Option<&str>,
    order_key: Option<&str>,
) -> String {
    match (func, arg) {
        (AggregateFunction::Count, None) => "count(*)".to_string(),
        (AggregateFunction::Sum, Some(a)) => format!("sum({})", a),
        (AggregateFunction::Count, Some(a)) => format!("count({})", a),
        (AggregateFunction::Min, Some(a)) => format!("min({})", a),
        (AggregateFunction::Max, Some(a)) => format!("max({})", a),
        (AggregateFunction::Avg, Some(a)) => format!("avg({})", a),
        (AggregateFunction::Cardinality, Some(a)) => format!("count(DISTINCT {})", a),
        (AggregateFunction::GroupConcat, Some(a)) => format!("group_concat(DISTINCT {})", a),
        // Reached only when a dialect renders first/last without a window.
        (AggregateFunction::First, Some(a)) => format!("min({})", order_key.unwrap_or(a)),
        (AggregateFunction::Last, Some(a)) => format!("max({})", order_key.unwrap_or(a)),
        (func, None) => format!("{}()", func.name()),
    }
}
