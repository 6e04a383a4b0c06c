use serde_json::Value;

use crate::dialect::{Dialect, WindowCall};
use crate::metrics::{Aggregation, Derivation, Function, SortDirection};

/// Dialect-independent SQL expression tree.
///
/// Literal values render as dialect placeholders and are collected as
/// ordered bindings; SQL text never embeds caller-supplied values.
#[derive(Debug, Clone)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    /// A value bound as a parameter at its render position.
    Bind(Value),
    /// A value rendered verbatim. Only definition-controlled literals
    /// (CASE results inside window arguments, DDL) use this.
    Literal(Value),
    Function {
        func: Function,
        args: Vec<SqlExpr>,
    },
    Case {
        branches: Vec<(SqlExpr, SqlExpr)>,
        else_expr: Box<SqlExpr>,
    },
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Aggregate {
        agg: Aggregation,
        expr: Box<SqlExpr>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    Between {
        expr: Box<SqlExpr>,
        low: Box<SqlExpr>,
        high: Box<SqlExpr>,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    Window {
        derivation: Derivation,
        arg: Option<Box<SqlExpr>>,
        partition_by: Vec<SqlExpr>,
        order_by: Vec<OrderItem>,
        offset: Option<i64>,
        n: Option<u64>,
        default: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum SqlBinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

/// A raw SQL source split at its parameter placeholders.
#[derive(Debug, Clone, Default)]
pub struct RawSql {
    pub segments: Vec<RawSegment>,
}

#[derive(Debug, Clone)]
pub enum RawSegment {
    Text(String),
    Bind(Value),
}

#[derive(Debug, Clone, Default)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
    /// When present, the FROM source is this derived table instead of a
    /// named relation.
    pub subquery: Option<RawSql>,
}

#[derive(Debug, Clone, Copy)]
pub enum SqlJoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl From<crate::metrics::JoinType> for SqlJoinType {
    fn from(join_type: crate::metrics::JoinType) -> Self {
        match join_type {
            crate::metrics::JoinType::Inner => SqlJoinType::Inner,
            crate::metrics::JoinType::Left => SqlJoinType::Left,
            crate::metrics::JoinType::Right => SqlJoinType::Right,
            crate::metrics::JoinType::Full => SqlJoinType::Full,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: SqlJoinType,
    pub table: TableRef,
    pub on: Vec<SqlExpr>,
}

#[derive(Debug, Clone)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A rendered statement with its ordered parameter bindings.
#[derive(Debug, Clone)]
pub struct RenderedSql {
    pub sql: String,
    pub bindings: Vec<Value>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Render a SELECT. Bindings are collected in text order, so the
    /// positional parameter list lines up with the placeholders.
    pub fn render_select(&self, query: &SelectQuery) -> RenderedSql {
        let mut bindings = Vec::new();

        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                let expr_sql = self.render_expr(&item.expr, &mut bindings);
                match &item.alias {
                    Some(alias) => format!("{expr_sql} AS {}", self.dialect.quote_ident(alias)),
                    None => expr_sql,
                }
            })
            .collect();

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_items.join(", "),
            self.render_table_ref(&query.from, &mut bindings)
        );

        for join in &query.joins {
            let join_kw = match join.join_type {
                SqlJoinType::Inner => "JOIN",
                SqlJoinType::Left => "LEFT JOIN",
                SqlJoinType::Right => "RIGHT JOIN",
                SqlJoinType::Full => "FULL JOIN",
            };
            let on_clause: Vec<String> = join
                .on
                .iter()
                .map(|e| self.render_expr(e, &mut bindings))
                .collect();
            sql.push_str(&format!(
                " {join_kw} {} ON {}",
                self.render_table_ref(&join.table, &mut bindings),
                on_clause.join(" AND ")
            ));
        }

        if !query.filters.is_empty() {
            let filters: Vec<String> = query
                .filters
                .iter()
                .map(|f| self.render_expr(f, &mut bindings))
                .collect();
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query
                .group_by
                .iter()
                .map(|g| self.render_expr(g, &mut bindings))
                .collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !query.having.is_empty() {
            let having: Vec<String> = query
                .having
                .iter()
                .map(|h| self.render_expr(h, &mut bindings))
                .collect();
            sql.push_str(&format!(" HAVING {}", having.join(" AND ")));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| self.render_order_item(o, &mut bindings))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        sql.push_str(&self.dialect.render_limit_offset(query.limit, query.offset));

        RenderedSql { sql, bindings }
    }

    fn render_order_item(&self, item: &OrderItem, bindings: &mut Vec<Value>) -> String {
        let expr = self.render_expr(&item.expr, bindings);
        let dir = match item.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        format!("{expr} {dir}")
    }

    fn render_table_ref(&self, table: &TableRef, bindings: &mut Vec<Value>) -> String {
        let source = match &table.subquery {
            Some(raw) => {
                let mut sql = String::from("(");
                for segment in &raw.segments {
                    match segment {
                        RawSegment::Text(text) => sql.push_str(text),
                        RawSegment::Bind(value) => {
                            sql.push_str(&self.dialect.placeholder(bindings.len()));
                            bindings.push(value.clone());
                        }
                    }
                }
                sql.push(')');
                sql
            }
            None => self.dialect.quote_ident(&table.name),
        };
        match &table.alias {
            Some(alias) => format!("{source} {}", self.dialect.quote_ident(alias)),
            None => source,
        }
    }

    fn render_expr(&self, expr: &SqlExpr, bindings: &mut Vec<Value>) -> String {
        match expr {
            SqlExpr::Column { table, name } => match table {
                Some(t) => format!(
                    "{}.{}",
                    self.dialect.quote_ident(t),
                    self.dialect.quote_ident(name)
                ),
                None => self.dialect.quote_ident(name),
            },
            SqlExpr::Bind(value) => {
                let placeholder = self.dialect.placeholder(bindings.len());
                bindings.push(value.clone());
                placeholder
            }
            SqlExpr::Literal(value) => self.dialect.render_literal(value),
            SqlExpr::Function { func, args } => {
                let rendered_args: Vec<String> = args
                    .iter()
                    .map(|a| self.render_expr(a, bindings))
                    .collect();
                self.dialect.render_function(func, rendered_args)
            }
            SqlExpr::Case {
                branches,
                else_expr,
            } => {
                let mut parts = Vec::new();
                parts.push("CASE".to_string());
                for (when, then) in branches {
                    parts.push(format!(
                        " WHEN {} THEN {}",
                        self.render_expr(when, bindings),
                        self.render_expr(then, bindings)
                    ));
                }
                parts.push(format!(
                    " ELSE {} END",
                    self.render_expr(else_expr, bindings)
                ));
                parts.join("")
            }
            SqlExpr::BinaryOp { op, left, right } => {
                let op_sql = match op {
                    SqlBinaryOperator::Add => "+",
                    SqlBinaryOperator::Subtract => "-",
                    SqlBinaryOperator::Multiply => "*",
                    SqlBinaryOperator::Divide => "/",
                    SqlBinaryOperator::Modulo => "%",
                    SqlBinaryOperator::And => "AND",
                    SqlBinaryOperator::Or => "OR",
                    SqlBinaryOperator::Eq => "=",
                    SqlBinaryOperator::Neq => "!=",
                    SqlBinaryOperator::Gt => ">",
                    SqlBinaryOperator::Gte => ">=",
                    SqlBinaryOperator::Lt => "<",
                    SqlBinaryOperator::Lte => "<=",
                    SqlBinaryOperator::Like => "LIKE",
                    SqlBinaryOperator::ILike => "ILIKE",
                };
                format!(
                    "({} {} {})",
                    self.render_expr(left, bindings),
                    op_sql,
                    self.render_expr(right, bindings)
                )
            }
            SqlExpr::Aggregate { agg, expr } => {
                let inner = self.render_expr(expr, bindings);
                self.dialect.render_aggregation(agg, &inner)
            }
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let rendered_values: Vec<String> = list
                    .iter()
                    .map(|v| self.render_expr(v, bindings))
                    .collect();
                let not_kw = if *negated { "NOT " } else { "" };
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr, bindings),
                    not_kw,
                    rendered_values.join(", ")
                )
            }
            SqlExpr::Between { expr, low, high } => format!(
                "{} BETWEEN {} AND {}",
                self.render_expr(expr, bindings),
                self.render_expr(low, bindings),
                self.render_expr(high, bindings)
            ),
            SqlExpr::IsNull { expr, negated } => {
                let not_kw = if *negated { " NOT" } else { "" };
                format!("{} IS{not_kw} NULL", self.render_expr(expr, bindings))
            }
            SqlExpr::Window {
                derivation,
                arg,
                partition_by,
                order_by,
                offset,
                n,
                default,
            } => {
                // Window arguments render literals inline: a dialect may
                // repeat the argument fragment, which would corrupt
                // positional binding order. These literals come from the
                // metric definition, not caller input.
                let arg = arg
                    .as_ref()
                    .map(|a| self.render_expr_inline(a));
                let partition = if partition_by.is_empty() {
                    None
                } else {
                    let cols: Vec<String> = partition_by
                        .iter()
                        .map(|p| self.render_expr_inline(p))
                        .collect();
                    Some(format!("PARTITION BY {}", cols.join(", ")))
                };
                let order = if order_by.is_empty() {
                    None
                } else {
                    let cols: Vec<String> = order_by
                        .iter()
                        .map(|o| {
                            let dir = match o.direction {
                                SortDirection::Asc => "ASC",
                                SortDirection::Desc => "DESC",
                            };
                            format!("{} {dir}", self.render_expr_inline(&o.expr))
                        })
                        .collect();
                    Some(format!("ORDER BY {}", cols.join(", ")))
                };
                let call = WindowCall {
                    derivation: *derivation,
                    arg,
                    partition,
                    order,
                    offset: *offset,
                    n: *n,
                    default: default.as_ref().map(|d| self.dialect.render_literal(d)),
                };
                self.dialect.render_window_function(&call)
            }
        }
    }

    /// Render an expression with literals emitted verbatim instead of
    /// bound. Used inside window frames and DDL.
    fn render_expr_inline(&self, expr: &SqlExpr) -> String {
        let mut scratch = Vec::new();
        let rendered = self.render_expr(&inline_binds(expr), &mut scratch);
        debug_assert!(scratch.is_empty());
        rendered
    }
}

/// Rewrite every `Bind` in a query to an inline literal. DDL statements
/// (rollup builds) cannot carry parameters in all engines.
pub(crate) fn inline_query_binds(query: &SelectQuery) -> SelectQuery {
    let mut out = query.clone();
    for item in &mut out.select {
        item.expr = inline_binds(&item.expr);
    }
    if let Some(raw) = &mut out.from.subquery {
        raw.segments = raw
            .segments
            .iter()
            .map(|segment| match segment {
                RawSegment::Bind(value) => RawSegment::Text(render_default_literal(value)),
                other => other.clone(),
            })
            .collect();
    }
    for join in &mut out.joins {
        join.on = join.on.iter().map(inline_binds).collect();
    }
    out.filters = out.filters.iter().map(inline_binds).collect();
    out.group_by = out.group_by.iter().map(inline_binds).collect();
    out.having = out.having.iter().map(inline_binds).collect();
    for item in &mut out.order_by {
        item.expr = inline_binds(&item.expr);
    }
    out
}

/// ANSI literal rendering for raw-SQL segments, where no dialect hook is
/// available.
fn render_default_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Rewrite `Bind` nodes to `Literal` so a fragment can be rendered
/// without consuming binding positions.
fn inline_binds(expr: &SqlExpr) -> SqlExpr {
    match expr {
        SqlExpr::Bind(value) => SqlExpr::Literal(value.clone()),
        SqlExpr::Column { .. } | SqlExpr::Literal(_) => expr.clone(),
        SqlExpr::Function { func, args } => SqlExpr::Function {
            func: func.clone(),
            args: args.iter().map(inline_binds).collect(),
        },
        SqlExpr::Case {
            branches,
            else_expr,
        } => SqlExpr::Case {
            branches: branches
                .iter()
                .map(|(when, then)| (inline_binds(when), inline_binds(then)))
                .collect(),
            else_expr: Box::new(inline_binds(else_expr)),
        },
        SqlExpr::BinaryOp { op, left, right } => SqlExpr::BinaryOp {
            op: *op,
            left: Box::new(inline_binds(left)),
            right: Box::new(inline_binds(right)),
        },
        SqlExpr::Aggregate { agg, expr } => SqlExpr::Aggregate {
            agg: agg.clone(),
            expr: Box::new(inline_binds(expr)),
        },
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => SqlExpr::InList {
            expr: Box::new(inline_binds(expr)),
            list: list.iter().map(inline_binds).collect(),
            negated: *negated,
        },
        SqlExpr::Between { expr, low, high } => SqlExpr::Between {
            expr: Box::new(inline_binds(expr)),
            low: Box::new(inline_binds(low)),
            high: Box::new(inline_binds(high)),
        },
        SqlExpr::IsNull { expr, negated } => SqlExpr::IsNull {
            expr: Box::new(inline_binds(expr)),
            negated: *negated,
        },
        SqlExpr::Window { .. } => expr.clone(),
    }
}
