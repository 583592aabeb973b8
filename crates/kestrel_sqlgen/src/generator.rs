//! SQL Text Generator: renders a compiled [`SelectStatement`] to text.
//!
//! One clause per line; a FROM subquery is opened on its own line and its
//! body indented by two spaces per nesting level.

use kestrel_expr::types::BinaryOp;

use crate::ast::{FromSource, SelectItem, SelectStatement, SqlExpr};
use crate::dialect::SqlDialect;

const INDENT: &str = "  ";

#[derive(Debug, Clone, Copy)]
pub struct SqlGenerator<'d> {
    dialect: &'d dyn SqlDialect,
}

impl<'d> SqlGenerator<'d> {
    pub fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn generate(&self, stmt: &SelectStatement) -> String {
        self.lines(stmt).join("\n")
    }

    fn lines(&self, stmt: &SelectStatement) -> Vec<String> {
        let mut out = Vec::new();
        let items: Vec<String> = stmt.select.iter().map(|i| self.select_item(i)).collect();
        out.push(format!("SELECT {}", items.join(", ")));

        match &stmt.from {
            FromSource::Table(name) => {
                out.push(format!("FROM {}", self.dialect.quote_identifier(name)));
            }
            FromSource::Subquery { query, alias } => {
                out.push("FROM".to_string());
                out.push("(".to_string());
                for line in self.lines(query) {
                    out.push(format!("{}{}", INDENT, line));
                }
                match alias {
                    Some(alias) => out.push(format!(") AS {}", alias)),
                    None => out.push(")".to_string()),
                }
            }
        }

        if let Some(pred) = &stmt.where_clause {
            out.push(format!("WHERE {}", self.expr(pred)));
        }
        if !stmt.group_by.is_empty() {
            let keys: Vec<String> = stmt.group_by.iter().map(|e| self.expr(e)).collect();
            out.push(format!("GROUP BY {}", keys.join(", ")));
        }
        if let Some(pred) = &stmt.having {
            out.push(format!("HAVING {}", self.expr(pred)));
        }
        if !stmt.order_by.is_empty() {
            let keys: Vec<String> = stmt
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{} {}",
                        self.expr(&o.expr),
                        if o.ascending { "ASC" } else { "DESC" }
                    )
                })
                .collect();
            out.push(format!("ORDER BY {}", keys.join(", ")));
        }
        if let Some(limit) = &stmt.limit {
            if limit.offset > 0 {
                out.push(format!("LIMIT {} OFFSET {}", limit.limit, limit.offset));
            } else {
                out.push(format!("LIMIT {}", limit.limit));
            }
        }
        out
    }

    fn select_item(&self, item: &SelectItem) -> String {
        let rendered = self.expr(&item.expr);
        match &item.alias {
            Some(alias) if item.expr.column_name() != Some(alias.as_str()) => {
                format!("{} AS {}", rendered, self.dialect.quote_identifier(alias))
            }
            _ => rendered,
        }
    }

    pub fn expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table: None, name } => self.dialect.quote_identifier(name),
            SqlExpr::Column {
                table: Some(table),
                name,
            } => format!(
                "{}.{}",
                self.dialect.quote_identifier(table),
                self.dialect.quote_identifier(name)
            ),
            SqlExpr::Literal(d) => d.to_sql_literal(),
            SqlExpr::Binary { op, left, right } => {
                let prec = precedence(*op);
                let l = self.operand(left, prec, false);
                let r = self.operand(right, prec, true);
                format!("{} {} {}", l, op.symbol(), r)
            }
            SqlExpr::Not(inner) => format!("NOT ({})", self.expr(inner)),
            SqlExpr::Function { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                format!("{}({})", name, args.join(", "))
            }
            SqlExpr::Aggregate {
                func,
                arg,
                order_key,
            } => {
                let arg = arg.as_ref().map(|a| self.expr(a));
                let key = order_key.as_ref().map(|k| self.expr(k));
                self.dialect
                    .render_aggregate(*func, arg.as_deref(), key.as_deref())
            }
            SqlExpr::Window {
                func,
                arg,
                partition_by,
                order_key,
            } => {
                let partitions: Vec<String> = partition_by.iter().map(|p| self.expr(p)).collect();
                self.dialect.render_window(
                    *func,
                    &self.expr(arg),
                    &partitions,
                    &self.expr(order_key),
                )
            }
            SqlExpr::TimeBucket {
                timestamp,
                step,
                shift,
            } => {
                let bucket = self.dialect.time_bucket(&self.expr(timestamp), *step);
                if *shift == 0 {
                    bucket
                } else {
                    format!("{} + {}", bucket, shift)
                }
            }
            SqlExpr::Timestamp(secs) => self.dialect.timestamp_literal(*secs),
            SqlExpr::Macro(value) => self.dialect.render_macro(value),
            SqlExpr::Star => "*".to_string(),
        }
    }

    /// Render a binary operand, parenthesised when it binds looser than its
    /// parent (or equally, on the right, since every operator is left-associative).
    fn operand(&self, expr: &SqlExpr, parent: u8, right: bool) -> String {
        let own = match expr {
            SqlExpr::Binary { op, .. } => precedence(*op),
            SqlExpr::TimeBucket { shift, .. } if *shift != 0 => precedence(BinaryOp::Add),
            _ => u8::MAX,
        };
        let rendered = self.expr(expr);
        if own < parent || (right && own == parent) {
            format!("({})", rendered)
        } else {
            rendered
        }
    }
}

fn precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Lt
        | BinaryOp::Lte
        | BinaryOp::Gt
        | BinaryOp::Gte
        | BinaryOp::Eq
        | BinaryOp::Ne => 3,
        BinaryOp::Add | BinaryOp::Sub => 4,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
    }
}
