#[cfg(test)]
mod planner_tests {
    use kestrel_common::config::PlannerConfig;
    use kestrel_common::datum::Datum;
    use kestrel_common::error::PlanError;
    use kestrel_common::types::{ArithmeticOp, CompareOp, QueryInterval};
    use kestrel_expr::metric::{MetricAggregateExpr, MetricField};
    use kestrel_expr::types::{BinaryOp, Expr};

    use crate::plan::QueryStep;
    use crate::planner::PhysicalPlanner;

    fn planner(pushdown: bool) -> PhysicalPlanner {
        PhysicalPlanner::new(
            PlannerConfig {
                enable_filter_pushdown: pushdown,
            },
            QueryInterval::new(3600, 7200),
        )
    }

    fn errors() -> MetricAggregateExpr {
        MetricAggregateExpr::new("http", MetricField::new("sum", "errorCount"))
    }

    fn leaf(step: &QueryStep) -> &kestrel_expr::metric::MetricQuery {
        match step {
            QueryStep::MetricAggregate { query } => query,
            other => panic!("expected leaf, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_literal() {
        let step = planner(true).plan(&Expr::literal(42i64), None).unwrap();
        assert_eq!(
            step,
            QueryStep::Literal {
                value: Datum::Int64(42)
            }
        );
        assert!(step.is_scalar());

        let err = planner(true).plan(&Expr::literal("x"), None).unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedExpression(_)));
    }

    #[test]
    fn test_plan_metric_merges_condition_into_filter() {
        let metric = errors().with_filter(Expr::compare(
            CompareOp::Eq,
            Expr::ident("app"),
            Expr::literal("svc"),
        ));
        let condition = Expr::compare(CompareOp::Eq, Expr::ident("dc"), Expr::literal("east"));
        let step = planner(true)
            .plan(&Expr::metric(metric), Some(&condition))
            .unwrap();
        let query = leaf(&step);
        assert_eq!(query.data_source, "http");
        assert_eq!(query.selectors.len(), 1);
        assert_eq!(query.selectors[0].output, "errorCount");
        assert_eq!(
            query.selectors[0].expr,
            Expr::call("sum", vec![Expr::ident("errorCount")])
        );
        let filter = query.filter.as_ref().unwrap();
        assert_eq!(
            kestrel_expr::normalize::split_conjuncts(filter).len(),
            2
        );
        assert!(query.predicate.is_none());
        assert_eq!(query.interval, QueryInterval::new(3600, 7200));
    }

    #[test]
    fn test_plan_arithmetic_over_two_metrics() {
        let expr = Expr::binary(
            BinaryOp::Div,
            Expr::metric(errors().with_group_by(["app"])),
            Expr::metric(
                MetricAggregateExpr::new("http", MetricField::new("sum", "totalCount"))
                    .with_group_by(["app"]),
            ),
        );
        let step = planner(true).plan(&expr, None).unwrap();
        match &step {
            QueryStep::Arithmetic {
                op,
                result_column,
                retained_columns,
                ..
            } => {
                assert_eq!(*op, ArithmeticOp::Div);
                assert_eq!(result_column, "value");
                assert!(retained_columns.is_empty());
            }
            other => panic!("expected arithmetic, got {:?}", other),
        }
        assert!(!step.is_scalar());
        assert_eq!(step.leaf_count(), 2);
    }

    #[test]
    fn test_plan_rejects_modulo_and_logical_operators() {
        let m = Expr::metric(errors());
        for op in [BinaryOp::Mod, BinaryOp::And, BinaryOp::Or] {
            let err = planner(true)
                .plan(&Expr::binary(op, m.clone(), Expr::literal(2i64)), None)
                .unwrap_err();
            assert!(
                matches!(err, PlanError::UnsupportedOperator { .. }),
                "{:?}",
                op
            );
        }
    }

    #[test]
    fn test_plan_offset_builds_delta_tree() {
        let metric = errors().with_offset("1h".parse().unwrap());
        let step = planner(true).plan(&Expr::metric(metric), None).unwrap();

        let (div_lhs, div_rhs) = match &step {
            QueryStep::Arithmetic {
                op: ArithmeticOp::Div,
                lhs,
                rhs,
                result_column,
                retained_columns,
            } => {
                assert_eq!(result_column, "delta");
                assert_eq!(retained_columns, &vec!["errorCount".to_string(), "1h".to_string()]);
                (lhs.as_ref(), rhs.as_ref())
            }
            other => panic!("expected Div, got {:?}", other),
        };
        let (curr, base) = match div_lhs {
            QueryStep::Arithmetic {
                op: ArithmeticOp::Sub,
                lhs,
                rhs,
                result_column,
                retained_columns,
            } => {
                assert_eq!(result_column, "diff");
                assert_eq!(retained_columns, &vec!["errorCount".to_string()]);
                (leaf(lhs), leaf(rhs))
            }
            other => panic!("expected Sub, got {:?}", other),
        };
        assert_eq!(leaf(div_rhs), base);

        let scaled = Expr::binary(
            BinaryOp::Mul,
            Expr::call("sum", vec![Expr::ident("errorCount")]),
            Expr::literal(1.0),
        );
        assert_eq!(curr.selectors[0].output, "errorCount");
        assert_eq!(curr.selectors[0].expr, scaled);
        assert!(curr.offset.is_none());
        assert_eq!(base.selectors[0].output, "1h");
        assert_eq!(base.selectors[0].expr, scaled);
        assert_eq!(base.offset.as_ref().unwrap().seconds(), 3600);
        assert_eq!(base.effective_interval(), QueryInterval::new(0, 3600));
        assert_eq!(step.leaf_count(), 3);
    }

    #[test]
    fn test_comparison_pushdown_attaches_predicate() {
        let expr = Expr::compare(CompareOp::Gt, Expr::metric(errors()), Expr::literal(10i64));
        let step = planner(true).plan(&expr, None).unwrap();
        let query = leaf(&step);
        assert_eq!(
            query.predicate,
            Some(Expr::compare(
                CompareOp::Gt,
                Expr::ident("errorCount"),
                Expr::literal(10i64)
            ))
        );
    }

    #[test]
    fn test_comparison_without_pushdown_builds_filter() {
        let expr = Expr::compare(CompareOp::Lte, Expr::metric(errors()), Expr::literal(10i64));
        let step = planner(false).plan(&expr, None).unwrap();
        match &step {
            QueryStep::Filter {
                op,
                threshold,
                input,
            } => {
                assert_eq!(*op, CompareOp::Lte);
                assert_eq!(*threshold, 10.0);
                assert!(leaf(input).predicate.is_none());
            }
            other => panic!("expected filter, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_over_arithmetic_is_filter_even_with_pushdown() {
        let ratio = Expr::binary(BinaryOp::Mul, Expr::metric(errors()), Expr::literal(100i64));
        let expr = Expr::compare(CompareOp::Ne, ratio, Expr::literal(0i64));
        let step = planner(true).plan(&expr, None).unwrap();
        assert!(matches!(step, QueryStep::Filter { op: CompareOp::Ne, .. }));
    }

    #[test]
    fn test_expected_value_offset_filters_on_delta() {
        let expr = Expr::compare(
            CompareOp::Gt,
            Expr::metric(errors()),
            Expr::ExpectedValue {
                value: Datum::Float64(0.5),
                offset: Some("-1d".parse().unwrap()),
            },
        );
        for pushdown in [true, false] {
            let step = planner(pushdown).plan(&expr, None).unwrap();
            match &step {
                QueryStep::Filter { input, threshold, .. } => {
                    assert_eq!(*threshold, 0.5);
                    assert!(matches!(
                        input.as_ref(),
                        QueryStep::Arithmetic { result_column, .. } if result_column == "delta"
                    ));
                }
                other => panic!("expected filter over delta, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_non_numeric_threshold_rejected() {
        let expr = Expr::compare(CompareOp::Eq, Expr::metric(errors()), Expr::literal("high"));
        let err = planner(true).plan(&expr, None).unwrap_err();
        assert_eq!(err, PlanError::NonNumericThreshold("high".into()));
    }

    #[test]
    fn test_zero_step_rejected() {
        let interval = QueryInterval {
            start: 3600,
            end: 7200,
            step: Some(0),
        };
        let planner = PhysicalPlanner::new(PlannerConfig::default(), interval);
        let err = planner.plan(&Expr::metric(errors()), None).unwrap_err();
        assert!(matches!(err, PlanError::InvalidInterval(_)));
    }

    #[test]
    fn test_explain_renders_tree() {
        let expr = Expr::compare(
            CompareOp::Gt,
            Expr::binary(
                BinaryOp::Add,
                Expr::metric(errors().with_group_by(["app"])),
                Expr::literal(1i64),
            ),
            Expr::literal(5i64),
        );
        let text = planner(true).plan(&expr, None).unwrap().explain();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Filter(GT 5)");
        assert_eq!(lines[1], "  Arithmetic(Add -> value)");
        assert!(lines[2].starts_with("    MetricAggregate(http: errorCount = sum(errorCount) by [app]"));
        assert_eq!(lines[3], "    Literal(1)");
    }
}
