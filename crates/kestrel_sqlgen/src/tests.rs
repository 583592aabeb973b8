#[cfg(test)]
mod compiler_tests {
    use kestrel_common::error::CompileError;
    use kestrel_common::types::{CompareOp, QueryInterval, TimeOffset};
    use kestrel_expr::metric::{Limit, OrderBy, Selector};
    use kestrel_expr::types::{BinaryOp, Expr};

    use crate::ast::{SqlExpr, StageKind};
    use crate::builder::SelectStatementBuilder;
    use crate::dialect::{ClickHouseDialect, H2Dialect, MySqlDialect, SqlDialect};
    use crate::generator::SqlGenerator;

    fn sum(col: &str) -> Expr {
        Expr::call("sum", vec![Expr::ident(col)])
    }

    fn window() -> QueryInterval {
        QueryInterval::new(0, 60)
    }

    fn render(dialect: &dyn SqlDialect, builder: &SelectStatementBuilder<'_>) -> String {
        let pipeline = builder.build().unwrap();
        SqlGenerator::new(dialect).generate(&pipeline.statement)
    }

    #[test]
    fn test_duplicate_aggregator_registered_once() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window()).fields(vec![Selector::new(
            "v",
            Expr::binary(BinaryOp::Add, sum("a"), sum("a")),
        )]);
        let pipeline = b.build().unwrap();
        assert_eq!(pipeline.aggregators.len(), 1);
        assert_eq!(
            pipeline.stages,
            vec![StageKind::Aggregation, StageKind::PostAggregation]
        );

        let sql = render(&d, &b);
        assert_eq!(sql.matches("sum(\"a\")").count(), 1);
        assert_eq!(
            sql,
            "SELECT \"_var0\" + \"_var0\" AS \"v\"\n\
             FROM\n\
             (\n\
             \x20 SELECT sum(\"a\") AS \"_var0\"\n\
             \x20 FROM \"t\"\n\
             \x20 WHERE \"timestamp\" >= fromUnixTimestamp(0) AND \"timestamp\" < fromUnixTimestamp(60)\n\
             )"
        );
    }

    #[test]
    fn test_shared_aggregator_under_two_outputs() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window()).fields(vec![
            Selector::new("a1", sum("a")),
            Selector::new("a2", sum("a")),
        ]);
        let pipeline = b.build().unwrap();
        assert_eq!(pipeline.aggregators.len(), 1);
        assert_eq!(pipeline.aggregators[0].alias, "a1");
        assert!(pipeline.has_stage(StageKind::PostAggregation));
        assert!(render(&d, &b).starts_with("SELECT \"a1\", \"a1\" AS \"a2\"\n"));
    }

    #[test]
    fn test_single_stage_when_selectors_are_aggregates() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("errors", sum("errorCount"))])
            .group_by(["app"]);
        let pipeline = b.build().unwrap();
        assert_eq!(pipeline.stages, vec![StageKind::Aggregation]);
        assert_eq!(
            render(&d, &b),
            "SELECT \"app\", sum(\"errorCount\") AS \"errors\"\n\
             FROM \"t\"\n\
             WHERE \"timestamp\" >= fromUnixTimestamp(0) AND \"timestamp\" < fromUnixTimestamp(60)\n\
             GROUP BY \"app\""
        );
    }

    #[test]
    fn test_clickhouse_last_is_plain_aggregate() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("v", Expr::call("last", vec![Expr::ident("value")]))]);
        let pipeline = b.build().unwrap();
        assert_eq!(pipeline.stages, vec![StageKind::Aggregation]);
        assert!(render(&d, &b).contains("argMax(\"value\", \"timestamp\") AS \"v\""));
    }

    #[test]
    fn test_h2_last_uses_window_stage() {
        let d = H2Dialect;
        let b = SelectStatementBuilder::new(&d, "t", QueryInterval::new(0, 120).with_step(60))
            .fields(vec![
                Selector::new("v", Expr::call("last", vec![Expr::ident("value")])),
                Selector::new("total", sum("count")),
            ])
            .group_by(["app"]);
        let pipeline = b.build().unwrap();
        assert_eq!(
            pipeline.stages,
            vec![StageKind::WindowAggregation, StageKind::Aggregation]
        );

        let window = pipeline.stage(StageKind::WindowAggregation).unwrap();
        assert!(window.where_clause.is_some());
        let names = window.output_names();
        assert_eq!(names, vec!["app", "_timestamp", "count", "v"]);

        let agg = pipeline.stage(StageKind::Aggregation).unwrap();
        assert!(agg.where_clause.is_none());
        assert_eq!(agg.group_by.len(), 3);

        let sql = render(&d, &b);
        assert!(sql.contains(
            "FIRST_VALUE(\"value\") OVER (PARTITION BY \"app\", FLOOR(DATEDIFF('SECOND', TIMESTAMP '1970-01-01 00:00:00', \"timestamp\") / 60) * 60 ORDER BY \"timestamp\" DESC) AS \"v\""
        ));
        assert!(sql.contains(") AS tbl0\nGROUP BY \"app\", \"_timestamp\", \"v\""));
        assert!(sql.starts_with("SELECT \"app\", \"_timestamp\", \"v\", sum(\"count\") AS \"total\"\n"));
    }

    #[test]
    fn test_window_alias_does_not_shadow_raw_column() {
        for d in [&H2Dialect as &dyn SqlDialect, &MySqlDialect] {
            let b = SelectStatementBuilder::new(d, "jvm", window()).fields(vec![
                Selector::new("heap", Expr::call("last", vec![Expr::ident("heap")])),
                Selector::new("maxHeap", Expr::call("max", vec![Expr::ident("heap")])),
            ]);
            let pipeline = b.build().unwrap();

            let window = pipeline.stage(StageKind::WindowAggregation).unwrap();
            let names = window.output_names();
            assert_eq!(names.iter().filter(|n| n.as_str() == "heap").count(), 1);
            assert!(names.contains(&"_var0".to_string()));

            let agg = pipeline.stage(StageKind::Aggregation).unwrap();
            assert_eq!(agg.output_names(), vec!["heap", "maxHeap"]);
            assert_eq!(agg.group_by, vec![SqlExpr::column("_var0")]);
        }
    }

    #[test]
    fn test_zero_step_rejected() {
        let d = ClickHouseDialect;
        let interval = QueryInterval {
            start: 0,
            end: 60,
            step: Some(0),
        };
        let b = SelectStatementBuilder::new(&d, "t", interval).fields(vec![Selector::new("v", sum("v"))]);
        assert!(matches!(b.build(), Err(CompileError::InvalidInterval(_))));
    }

    #[test]
    fn test_window_aggregator_requires_identifier() {
        let d = H2Dialect;
        let arg = Expr::binary(BinaryOp::Mul, Expr::ident("a"), Expr::literal(2i64));
        let err = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("v", Expr::call("first", vec![arg]))])
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::IdentifierRequired { .. }));
    }

    #[test]
    fn test_raw_filter_pushed_and_output_filter_elevated_to_having() {
        let d = ClickHouseDialect;
        let filter = Expr::and(
            Expr::compare(CompareOp::Eq, Expr::ident("app"), Expr::literal("svc")),
            Expr::compare(CompareOp::Gt, Expr::ident("errors"), Expr::literal(10i64)),
        );
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("errors", sum("errorCount"))])
            .group_by(["app"])
            .filter(filter);
        let sql = render(&d, &b);
        assert!(sql.contains(
            "WHERE \"timestamp\" >= fromUnixTimestamp(0) AND \"timestamp\" < fromUnixTimestamp(60) AND \"t\".\"app\" = 'svc'\n"
        ));
        assert!(sql.ends_with("GROUP BY \"app\"\nHAVING sum(\"errorCount\") > 10"));
    }

    #[test]
    fn test_having_expands_post_aggregation_outputs() {
        let d = H2Dialect;
        let ratio = Expr::binary(BinaryOp::Div, sum("a"), Expr::call("count", vec![]));
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("ratio", ratio)])
            .group_by(["app"])
            .filter(Expr::compare(CompareOp::Gte, Expr::ident("ratio"), Expr::literal(0.5)));
        let pipeline = b.build().unwrap();
        let agg = pipeline.stage(StageKind::Aggregation).unwrap();
        let having = SqlGenerator::new(&d).expr(agg.having.as_ref().unwrap());
        assert_eq!(having, "sum(\"a\") / count(*) >= 0.5");
        assert!(!pipeline.has_stage(StageKind::OuterFilter));
    }

    #[test]
    fn test_ungrouped_output_filter_wraps_aggregation_stage() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("errors", sum("errorCount"))])
            .filter(Expr::compare(CompareOp::Gt, Expr::ident("errors"), Expr::literal(10i64)));
        let pipeline = b.build().unwrap();
        assert_eq!(
            pipeline.stages,
            vec![StageKind::Aggregation, StageKind::OuterFilter]
        );
        let sql = render(&d, &b);
        assert!(sql.starts_with("SELECT *\nFROM\n(\n  SELECT sum(\"errorCount\") AS \"errors\"\n"));
        assert!(sql.ends_with(")\nWHERE \"errors\" > 10"));
    }

    #[test]
    fn test_alias_in_where_depends_on_dialect() {
        let ratio = Expr::binary(BinaryOp::Div, sum("a"), Expr::call("count", vec![]));
        let filter = Expr::compare(CompareOp::Gt, Expr::ident("ratio"), Expr::literal(1i64));

        let ch = ClickHouseDialect;
        let pipeline = SelectStatementBuilder::new(&ch, "t", window())
            .fields(vec![Selector::new("ratio", ratio.clone())])
            .filter(filter.clone())
            .build()
            .unwrap();
        assert_eq!(
            pipeline.stages,
            vec![StageKind::Aggregation, StageKind::PostAggregation]
        );
        assert!(pipeline.statement.where_clause.is_some());

        let h2 = H2Dialect;
        let pipeline = SelectStatementBuilder::new(&h2, "t", window())
            .fields(vec![Selector::new("ratio", ratio)])
            .filter(filter)
            .build()
            .unwrap();
        assert_eq!(
            pipeline.stages,
            vec![
                StageKind::Aggregation,
                StageKind::PostAggregation,
                StageKind::OuterFilter
            ]
        );
    }

    #[test]
    fn test_group_by_and_bucket_threaded_through_post_stage() {
        let d = ClickHouseDialect;
        let rate = Expr::binary(BinaryOp::Div, sum("a"), Expr::Macro("interval".into()));
        let b = SelectStatementBuilder::new(&d, "t", QueryInterval::new(0, 120).with_step(60))
            .fields(vec![Selector::new("rate", rate)])
            .group_by(["app", "host"]);
        let pipeline = b.build().unwrap();
        let agg = pipeline.stage(StageKind::Aggregation).unwrap();
        assert_eq!(agg.group_by.len(), 3);
        assert!(pipeline.statement.group_by.is_empty());

        let sql = render(&d, &b);
        assert!(sql.starts_with("SELECT \"app\", \"host\", \"_timestamp\", \"_var0\" / 60 AS \"rate\"\n"));
        assert!(sql.contains(
            "  SELECT \"app\", \"host\", floor(toUnixTimestamp(\"timestamp\") / 60) * 60 AS \"_timestamp\", sum(\"a\") AS \"_var0\"\n"
        ));
    }

    #[test]
    fn test_offset_moves_bucket_label_not_window() {
        let d = ClickHouseDialect;
        let offset: TimeOffset = "1h".parse().unwrap();
        let b = SelectStatementBuilder::new(&d, "t", QueryInterval::new(0, 3600).with_step(60))
            .fields(vec![Selector::new("v", sum("a"))])
            .offset(offset);
        let sql = render(&d, &b);
        assert!(sql.contains("floor(toUnixTimestamp(\"timestamp\") / 60) * 60 + 3600 AS \"_timestamp\""));
        assert!(sql.contains("fromUnixTimestamp(0) AND \"timestamp\" < fromUnixTimestamp(3600)"));
    }

    #[test]
    fn test_instance_count_macro() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window())
            .instance_column("instance")
            .fields(vec![Selector::new("instances", Expr::Macro("instanceCount".into()))]);
        assert!(render(&d, &b).starts_with("SELECT uniqExact(\"instance\") AS \"instances\"\n"));

        let m = MySqlDialect;
        let b = SelectStatementBuilder::new(&m, "t", window())
            .fields(vec![Selector::new("instances", Expr::Macro("instanceCount".into()))]);
        assert!(render(&m, &b).starts_with("SELECT count(DISTINCT `instanceName`) AS `instances`\n"));
    }

    #[test]
    fn test_order_by_and_limit_on_outermost_stage() {
        let d = MySqlDialect;
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new(
                "v",
                Expr::binary(BinaryOp::Mul, sum("a"), Expr::literal(1.0)),
            )])
            .group_by(["app"])
            .order_by(OrderBy {
                column: "v".into(),
                ascending: false,
            })
            .limit(Limit {
                limit: 10,
                offset: 5,
            });
        let sql = render(&d, &b);
        assert!(sql.ends_with(") AS tbl0\nORDER BY `v` DESC\nLIMIT 10 OFFSET 5"));
        assert!(sql.starts_with("SELECT `app`, `_var0` * 1.0 AS `v`\n"));
        assert!(sql.contains("WHERE `timestamp` >= FROM_UNIXTIME(0) AND `timestamp` < FROM_UNIXTIME(60)"));
    }

    #[test]
    fn test_compile_errors() {
        let d = ClickHouseDialect;
        let compile = |expr: Expr| {
            SelectStatementBuilder::new(&d, "t", window())
                .fields(vec![Selector::new("v", expr)])
                .build()
                .unwrap_err()
        };

        let nested = Expr::call("sum", vec![Expr::call("max", vec![Expr::ident("a")])]);
        assert!(matches!(compile(nested), CompileError::NestedAggregator { .. }));

        let modulo = Expr::binary(BinaryOp::Mod, sum("a"), Expr::literal(2i64));
        assert_eq!(compile(modulo), CompileError::UnsupportedOperator("%".into()));

        let compare = Expr::compare(CompareOp::Gt, sum("a"), Expr::literal(2i64));
        assert!(matches!(compile(compare), CompileError::UnsupportedOperator(_)));

        let two_args = Expr::call("sum", vec![Expr::ident("a"), Expr::ident("b")]);
        assert!(matches!(
            compile(two_args),
            CompileError::ArgumentCount { got: 2, .. }
        ));

        let unknown = Expr::call("median", vec![Expr::ident("a")]);
        assert_eq!(compile(unknown), CompileError::UnknownFunction("median".into()));

        let bad_macro = Expr::binary(BinaryOp::Div, sum("a"), Expr::Macro("bogus".into()));
        assert_eq!(compile(bad_macro), CompileError::UnknownMacro("bogus".into()));

        let ungrouped = Expr::binary(BinaryOp::Add, sum("a"), Expr::ident("b"));
        assert!(matches!(compile(ungrouped), CompileError::InvalidExpression(_)));
    }

    #[test]
    fn test_scalar_function_in_selector() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window()).fields(vec![Selector::new(
            "v",
            Expr::call("ROUND", vec![sum("a")]),
        )]);
        assert!(render(&d, &b).starts_with("SELECT round(\"_var0\") AS \"v\"\n"));
    }

    #[test]
    fn test_aggregator_state_is_per_compilation() {
        let d = ClickHouseDialect;
        let b = SelectStatementBuilder::new(&d, "t", window())
            .fields(vec![Selector::new("v", Expr::binary(BinaryOp::Add, sum("a"), sum("b")))]);
        let first = b.build().unwrap();
        let second = b.build().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.aggregators[0].alias, "_var0");
        assert_eq!(second.aggregators[1].alias, "_var1");
    }
}

#[cfg(test)]
mod generator_tests {
    use kestrel_common::config::DialectKind;
    use kestrel_expr::types::BinaryOp;

    use crate::ast::SqlExpr;
    use crate::dialect::{dialect_for, ClickHouseDialect, H2Dialect, MySqlDialect, SqlDialect};
    use crate::generator::SqlGenerator;

    fn col(name: &str) -> SqlExpr {
        SqlExpr::column(name)
    }

    #[test]
    fn test_precedence_parentheses() {
        let d = ClickHouseDialect;
        let g = SqlGenerator::new(&d);
        let right_nested = SqlExpr::binary(
            BinaryOp::Sub,
            col("a"),
            SqlExpr::binary(BinaryOp::Sub, col("b"), col("c")),
        );
        assert_eq!(g.expr(&right_nested), "\"a\" - (\"b\" - \"c\")");

        let left_nested = SqlExpr::binary(
            BinaryOp::Sub,
            SqlExpr::binary(BinaryOp::Sub, col("a"), col("b")),
            col("c"),
        );
        assert_eq!(g.expr(&left_nested), "\"a\" - \"b\" - \"c\"");

        let mixed = SqlExpr::binary(
            BinaryOp::Mul,
            SqlExpr::binary(BinaryOp::Add, col("a"), col("b")),
            col("c"),
        );
        assert_eq!(g.expr(&mixed), "(\"a\" + \"b\") * \"c\"");

        let or_in_and = SqlExpr::and(
            SqlExpr::binary(BinaryOp::Or, col("x"), col("y")),
            col("z"),
        );
        assert_eq!(g.expr(&or_in_and), "(\"x\" OR \"y\") AND \"z\"");
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(MySqlDialect.quote_identifier("a`b"), "`a``b`");
        assert_eq!(H2Dialect.quote_identifier("a\"b"), "\"a\"\"b\"");
        let d = MySqlDialect;
        let g = SqlGenerator::new(&d);
        assert_eq!(g.expr(&SqlExpr::qualified("t", "app")), "`t`.`app`");
    }

    #[test]
    fn test_timestamp_literals() {
        assert_eq!(
            H2Dialect.timestamp_literal(60),
            "TIMESTAMP '1970-01-01 00:01:00'"
        );
        assert_eq!(MySqlDialect.timestamp_literal(60), "FROM_UNIXTIME(60)");
        assert_eq!(ClickHouseDialect.timestamp_literal(60), "fromUnixTimestamp(60)");
    }

    #[test]
    fn test_dialect_capabilities() {
        let ch = dialect_for(DialectKind::ClickHouse);
        assert_eq!(ch.name(), "clickhouse");
        assert!(ch.allow_alias_in_where());
        assert!(!ch.requires_subquery_alias());

        let h2 = dialect_for(DialectKind::H2);
        assert!(!h2.allow_alias_in_where());
        assert!(h2.requires_subquery_alias());

        assert_eq!(dialect_for(DialectKind::MySql).name(), "mysql");
    }

    #[test]
    fn test_text_literal_escaping() {
        let d = ClickHouseDialect;
        let g = SqlGenerator::new(&d);
        let lit = SqlExpr::Literal("it's".into());
        assert_eq!(g.expr(&lit), "'it''s'");
    }
}
