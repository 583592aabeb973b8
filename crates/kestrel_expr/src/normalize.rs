//! Predicate helpers shared by the planner, the SQL compiler and the
//! in-memory data source.
//!
//! - Conjunction flattening / rebuilding
//! - Identifier collection (which columns a predicate depends on)
//! - Identifier rewriting

use std::collections::HashSet;

use crate::types::{BinaryOp, Expr};

/// Flatten nested ANDs into a conjunct list.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    let mut out = Vec::new();
    collect_conjuncts(expr, &mut out);
    out
}

fn collect_conjuncts(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other.clone()),
    }
}

/// Rebuild a left-deep AND chain; `None` for an empty list.
pub fn conjoin(conjuncts: Vec<Expr>) -> Option<Expr> {
    conjuncts.into_iter().reduce(Expr::and)
}

/// AND two optional predicates together.
pub fn and_optional(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
    match (left, right) {
        (Some(l), Some(r)) => Some(Expr::and(l, r)),
        (l, None) => l,
        (None, r) => r,
    }
}

/// Names of all identifiers referenced by `expr`, in first-seen order.
pub fn referenced_identifiers(expr: &Expr) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    visit_identifiers(expr, &mut |name: &str| {
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    });
    out
}

fn visit_identifiers(expr: &Expr, f: &mut dyn FnMut(&str)) {
    match expr {
        Expr::Identifier(name) => f(name),
        Expr::Function { args, .. } => {
            for arg in args {
                visit_identifiers(arg, f);
            }
        }
        Expr::Binary { left, right, .. } => {
            visit_identifiers(left, f);
            visit_identifiers(right, f);
        }
        Expr::Not(inner) => visit_identifiers(inner, f),
        Expr::Literal(_)
        | Expr::Macro(_)
        | Expr::MetricAggregate(_)
        | Expr::ExpectedValue { .. } => {}
    }
}

/// Replace identifiers for which `f` returns a substitute.
pub fn rewrite_identifiers(expr: &Expr, f: &dyn Fn(&str) -> Option<Expr>) -> Expr {
    match expr {
        Expr::Identifier(name) => f(name).unwrap_or_else(|| expr.clone()),
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(|a| rewrite_identifiers(a, f)).collect(),
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(rewrite_identifiers(left, f)),
            right: Box::new(rewrite_identifiers(right, f)),
        },
        Expr::Not(inner) => Expr::Not(Box::new(rewrite_identifiers(inner, f))),
        other => other.clone(),
    }
}
