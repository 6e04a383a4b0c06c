//! Renderer-level tests: AST to SQL text with ordered bindings.

use serde_json::json;

use metriq::dialect::{DuckDbDialect, PostgresDialect};
use metriq::metrics::{Aggregation, Derivation, SortDirection};
use metriq::sql_ast::{
    OrderItem, RawSegment, RawSql, SelectItem, SelectQuery, SqlBinaryOperator, SqlExpr,
    SqlRenderer, TableRef,
};

fn column(table: &str, name: &str) -> SqlExpr {
    SqlExpr::Column {
        table: Some(table.to_string()),
        name: name.to_string(),
    }
}

fn orders_query() -> SelectQuery {
    SelectQuery {
        select: vec![SelectItem {
            expr: SqlExpr::Aggregate {
                agg: Aggregation::Sum,
                expr: Box::new(column("o", "amount")),
            },
            alias: Some("total".to_string()),
        }],
        from: TableRef {
            name: "orders".to_string(),
            alias: Some("o".to_string()),
            subquery: None,
        },
        ..SelectQuery::default()
    }
}

#[test]
fn bindings_collect_in_text_order() {
    let mut query = orders_query();
    query.filters = vec![
        SqlExpr::BinaryOp {
            op: SqlBinaryOperator::Eq,
            left: Box::new(column("o", "country")),
            right: Box::new(SqlExpr::Bind(json!("US"))),
        },
        SqlExpr::InList {
            expr: Box::new(column("o", "status")),
            list: vec![SqlExpr::Bind(json!("open")), SqlExpr::Bind(json!("paid"))],
            negated: false,
        },
    ];
    query.having = vec![SqlExpr::BinaryOp {
        op: SqlBinaryOperator::Gt,
        left: Box::new(SqlExpr::Aggregate {
            agg: Aggregation::Sum,
            expr: Box::new(column("o", "amount")),
        }),
        right: Box::new(SqlExpr::Bind(json!(100))),
    }];
    query.group_by = vec![column("o", "country")];

    let rendered = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert_eq!(
        rendered.sql,
        "SELECT SUM(\"o\".\"amount\") AS \"total\" FROM \"orders\" \"o\" \
         WHERE (\"o\".\"country\" = ?) AND \"o\".\"status\" IN (?, ?) \
         GROUP BY \"o\".\"country\" HAVING (SUM(\"o\".\"amount\") > ?)"
    );
    assert_eq!(
        rendered.bindings,
        vec![json!("US"), json!("open"), json!("paid"), json!(100)]
    );
}

#[test]
fn postgres_placeholders_are_positional() {
    let mut query = orders_query();
    query.filters = vec![
        SqlExpr::BinaryOp {
            op: SqlBinaryOperator::Gte,
            left: Box::new(column("o", "amount")),
            right: Box::new(SqlExpr::Bind(json!(10))),
        },
        SqlExpr::BinaryOp {
            op: SqlBinaryOperator::Lte,
            left: Box::new(column("o", "amount")),
            right: Box::new(SqlExpr::Bind(json!(99))),
        },
    ];
    let rendered = SqlRenderer::new(&PostgresDialect).render_select(&query);
    assert!(rendered.sql.contains("$1"));
    assert!(rendered.sql.contains("$2"));
    assert_eq!(rendered.bindings.len(), 2);
}

#[test]
fn raw_subquery_binds_in_from_position() {
    let mut query = orders_query();
    query.from = TableRef {
        name: "src".to_string(),
        alias: Some("src".to_string()),
        subquery: Some(RawSql {
            segments: vec![
                RawSegment::Text("SELECT * FROM orders WHERE region = ".to_string()),
                RawSegment::Bind(json!("EMEA")),
            ],
        }),
    };
    query.select = vec![SelectItem {
        expr: column("src", "amount"),
        alias: None,
    }];
    query.filters = vec![SqlExpr::BinaryOp {
        op: SqlBinaryOperator::Gt,
        left: Box::new(column("src", "amount")),
        right: Box::new(SqlExpr::Bind(json!(5))),
    }];

    let rendered = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert!(rendered
        .sql
        .contains("FROM (SELECT * FROM orders WHERE region = ?) \"src\""));
    // FROM binding precedes WHERE binding, matching text order.
    assert_eq!(rendered.bindings, vec![json!("EMEA"), json!(5)]);
}

#[test]
fn case_between_and_null_predicates_render() {
    let mut query = orders_query();
    query.select.push(SelectItem {
        expr: SqlExpr::Case {
            branches: vec![(
                SqlExpr::BinaryOp {
                    op: SqlBinaryOperator::Eq,
                    left: Box::new(column("o", "country")),
                    right: Box::new(SqlExpr::Bind(json!("US"))),
                },
                column("o", "amount"),
            )],
            else_expr: Box::new(SqlExpr::Bind(json!(0))),
        },
        alias: Some("us_amount".to_string()),
    });
    query.filters = vec![
        SqlExpr::Between {
            expr: Box::new(column("o", "amount")),
            low: Box::new(SqlExpr::Bind(json!(1))),
            high: Box::new(SqlExpr::Bind(json!(10))),
        },
        SqlExpr::IsNull {
            expr: Box::new(column("o", "deleted_at")),
            negated: false,
        },
    ];

    let rendered = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert!(rendered.sql.contains("CASE WHEN"));
    assert!(rendered.sql.contains("BETWEEN ? AND ?"));
    assert!(rendered.sql.contains("\"o\".\"deleted_at\" IS NULL"));
    assert_eq!(rendered.bindings.len(), 4);
}

#[test]
fn window_expression_inlines_definition_literals() {
    let mut query = orders_query();
    query.select.push(SelectItem {
        expr: SqlExpr::Window {
            derivation: Derivation::Lag,
            arg: Some(Box::new(SqlExpr::Aggregate {
                agg: Aggregation::Sum,
                expr: Box::new(column("o", "amount")),
            })),
            partition_by: vec![column("o", "country")],
            order_by: vec![OrderItem {
                expr: column("o", "month"),
                direction: SortDirection::Asc,
            }],
            offset: Some(2),
            n: None,
            default: Some(json!(0)),
        },
        alias: Some("prev".to_string()),
    });

    let rendered = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert!(rendered.sql.contains(
        "LAG(SUM(\"o\".\"amount\"), 2, 0) OVER (PARTITION BY \"o\".\"country\" ORDER BY \"o\".\"month\" ASC)"
    ));
    // Window pieces never consume binding slots.
    assert!(rendered.bindings.is_empty());
}

#[test]
fn order_and_limit_render_after_having() {
    let mut query = orders_query();
    query.order_by = vec![OrderItem {
        expr: SqlExpr::Column {
            table: None,
            name: "total".to_string(),
        },
        direction: SortDirection::Desc,
    }];
    query.limit = Some(10);
    query.offset = Some(20);

    let rendered = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert!(rendered.sql.ends_with("ORDER BY \"total\" DESC LIMIT 10 OFFSET 20"));
}
