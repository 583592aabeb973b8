#[cfg(test)]
mod normalize_tests {
    use kestrel_common::types::CompareOp;

    use crate::normalize::*;
    use crate::types::{BinaryOp, Expr};

    fn eq(col: &str, v: &str) -> Expr {
        Expr::compare(CompareOp::Eq, Expr::ident(col), Expr::literal(v))
    }

    #[test]
    fn test_split_and_conjoin() {
        let pred = Expr::and(eq("app", "a"), Expr::and(eq("host", "h"), eq("dc", "x")));
        let parts = split_conjuncts(&pred);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], eq("app", "a"));
        assert_eq!(parts[2], eq("dc", "x"));

        let rebuilt = conjoin(parts).unwrap();
        assert_eq!(split_conjuncts(&rebuilt).len(), 3);
        assert!(conjoin(vec![]).is_none());
    }

    #[test]
    fn test_or_is_a_single_conjunct() {
        let pred = Expr::binary(BinaryOp::Or, eq("app", "a"), eq("app", "b"));
        assert_eq!(split_conjuncts(&pred).len(), 1);
    }

    #[test]
    fn test_and_optional() {
        assert!(and_optional(None, None).is_none());
        assert_eq!(and_optional(Some(eq("a", "1")), None), Some(eq("a", "1")));
        let both = and_optional(Some(eq("a", "1")), Some(eq("b", "2"))).unwrap();
        assert_eq!(split_conjuncts(&both).len(), 2);
    }

    #[test]
    fn test_referenced_identifiers_dedup_in_order() {
        let e = Expr::binary(
            BinaryOp::Div,
            Expr::call("sum", vec![Expr::ident("errorCount")]),
            Expr::binary(
                BinaryOp::Add,
                Expr::call("sum", vec![Expr::ident("totalCount")]),
                Expr::ident("errorCount"),
            ),
        );
        assert_eq!(referenced_identifiers(&e), vec!["errorCount", "totalCount"]);
    }

    #[test]
    fn test_rewrite_identifiers() {
        let e = Expr::compare(CompareOp::Gt, Expr::ident("ratio"), Expr::literal(0.5));
        let rewritten = rewrite_identifiers(&e, &|name: &str| {
            (name == "ratio").then(|| Expr::ident("_var0"))
        });
        assert_eq!(referenced_identifiers(&rewritten), vec!["_var0"]);
    }
}

#[cfg(test)]
mod metric_tests {
    use kestrel_common::types::{QueryInterval, TimeOffset};

    use crate::metric::*;
    use crate::types::{AggregateFunction, Expr};

    #[test]
    fn test_effective_interval_moves_back_with_offset() {
        let mut q = MetricQuery::new("jvm", QueryInterval::new(7200, 10800));
        assert_eq!(q.effective_interval(), QueryInterval::new(7200, 10800));
        q.offset = Some("1h".parse::<TimeOffset>().unwrap());
        assert_eq!(q.effective_interval(), QueryInterval::new(3600, 7200));
    }

    #[test]
    fn test_scalar_leaf() {
        let mut q = MetricQuery::new("jvm", QueryInterval::new(0, 60));
        assert!(q.is_scalar());
        q.group_by = vec!["app".into()];
        assert!(!q.is_scalar());
        let q = MetricQuery::new("jvm", QueryInterval::new(0, 60).with_step(10));
        assert!(!q.is_scalar());
    }

    #[test]
    fn test_field_expr_and_display() {
        let m = MetricAggregateExpr::new("http", MetricField::new("sum", "errorCount"))
            .with_group_by(["app"]);
        let e = m.field.to_expr();
        let (f, args) = e.as_aggregate().unwrap();
        assert_eq!(f, AggregateFunction::Sum);
        assert_eq!(args[0], Expr::ident("errorCount"));
        assert_eq!(m.to_string(), "sum(http.errorCount) by (app)");
    }

    #[test]
    fn test_aggregate_name_lookup_is_case_insensitive() {
        assert_eq!(AggregateFunction::from_name("SUM"), Some(AggregateFunction::Sum));
        assert_eq!(
            AggregateFunction::from_name("groupConcat"),
            Some(AggregateFunction::GroupConcat)
        );
        assert_eq!(AggregateFunction::from_name("rate"), None);
        assert!(AggregateFunction::Last.is_positional());
    }
}
