use serde::{de, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declarative metric definition: the unit of execution.
///
/// A metric names a source (a physical table or a custom SQL query,
/// mutually exclusive) on one data source, plus ordered component lists.
/// Component order is preserved from the definition; lookups are by name.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticMetric {
    pub name: String,
    pub alias: Option<String>,
    pub data_source: String,
    /// Physical table backing the metric.
    pub table: Option<String>,
    /// Custom SQL source, used as a derived table instead of `table`.
    pub sql: Option<String>,
    /// Emit GROUP BY over the non-aggregated select items.
    pub grouped: bool,
    /// Honor the `order` list when compiling.
    pub ordered: bool,
    pub order: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub measures: Vec<Measure>,
    pub dimensions: Vec<Dimension>,
    pub filters: Vec<Filter>,
    pub joins: Vec<Join>,
    pub parameters: Vec<Parameter>,
    pub cache: Option<CachePolicy>,
    pub description: Option<String>,
}

impl<'de> Deserialize<'de> for SemanticMetric {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            name: String,
            alias: Option<String>,
            data_source: String,
            #[serde(default)]
            table: Option<String>,
            #[serde(default)]
            sql: Option<String>,
            #[serde(default = "default_true")]
            grouped: bool,
            #[serde(default)]
            ordered: bool,
            #[serde(default)]
            order: Vec<OrderItem>,
            #[serde(default)]
            limit: Option<u64>,
            #[serde(default)]
            measures: Vec<Measure>,
            #[serde(default)]
            dimensions: Vec<Dimension>,
            #[serde(default)]
            filters: Vec<Filter>,
            #[serde(default)]
            joins: Vec<Join>,
            #[serde(default)]
            parameters: Vec<Parameter>,
            #[serde(default)]
            cache: Option<CachePolicy>,
            description: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;

        match (&raw.table, &raw.sql) {
            (Some(_), Some(_)) => {
                return Err(de::Error::custom(
                    "metric is invalid: 'table' and 'sql' are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(de::Error::custom(
                    "metric is invalid: either 'table' or 'sql' must be specified",
                ))
            }
            _ => {}
        }

        Ok(SemanticMetric {
            name: raw.name,
            alias: raw.alias,
            data_source: raw.data_source,
            table: raw.table,
            sql: raw.sql,
            grouped: raw.grouped,
            ordered: raw.ordered,
            order: raw.order,
            limit: raw.limit,
            measures: raw.measures,
            dimensions: raw.dimensions,
            filters: raw.filters,
            joins: raw.joins,
            parameters: raw.parameters,
            cache: raw.cache,
            description: raw.description,
        })
    }
}

fn default_true() -> bool {
    true
}

impl SemanticMetric {
    /// The identifier the base relation is referenced by inside the query.
    pub fn base_alias(&self) -> &str {
        match (&self.alias, &self.table) {
            (Some(alias), _) => alias,
            (None, Some(table)) => table,
            (None, None) => &self.name,
        }
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name == name)
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn join(&self, name: &str) -> Option<&Join> {
        self.joins.iter().find(|j| j.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// An aggregatable value.
///
/// A measure aggregates either a plain column expression or a conditional
/// CASE tree; exactly one of the two must be present.
#[derive(Debug, Clone, Serialize)]
pub struct Measure {
    pub name: String,
    pub agg: Aggregation,
    pub expr: Option<Expr>,
    /// Owning table in the join graph; defaults to the metric's base table.
    pub table: Option<String>,
    pub conditional: Option<Conditional>,
    pub format: Option<FormatSpec>,
    pub description: Option<String>,
}

impl<'de> Deserialize<'de> for Measure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            name: String,
            agg: Aggregation,
            #[serde(default)]
            expr: Option<Expr>,
            #[serde(default)]
            table: Option<String>,
            #[serde(default)]
            conditional: Option<Conditional>,
            #[serde(default)]
            format: Option<FormatSpec>,
            description: Option<String>,
        }
        let raw = Raw::deserialize(deserializer)?;

        if raw.expr.is_some() && raw.conditional.is_some() {
            return Err(de::Error::custom(format!(
                "measure {} is invalid: 'expr' and 'conditional' are mutually exclusive",
                raw.name
            )));
        }
        if raw.expr.is_none() && raw.conditional.is_none() {
            return Err(de::Error::custom(format!(
                "measure {} is invalid: either 'expr' or 'conditional' must be specified",
                raw.name
            )));
        }

        Ok(Measure {
            name: raw.name,
            agg: raw.agg,
            expr: raw.expr,
            table: raw.table,
            conditional: raw.conditional,
            format: raw.format,
            description: raw.description,
        })
    }
}

impl Measure {
    /// The expression fed to the aggregation function.
    pub fn input_expr(&self) -> Expr {
        match (&self.conditional, &self.expr) {
            (Some(cond), _) => cond.to_expr(),
            (None, Some(expr)) => expr.clone(),
            // Unreachable after deserialization, but keep a sane fallback
            // for hand-built values.
            (None, None) => Expr::Column {
                column: self.name.clone(),
            },
        }
    }
}

/// A groupable attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: String,
    #[serde(default)]
    pub expr: Option<Expr>,
    /// Owning table in the join graph; defaults to the metric's base table.
    #[serde(default)]
    pub table: Option<String>,
    /// Concatenate several columns with a delimiter.
    #[serde(default)]
    pub combine: Option<CombineSpec>,
    #[serde(default)]
    pub conditional: Option<Conditional>,
    #[serde(default)]
    pub format: Option<FormatSpec>,
    pub description: Option<String>,
}

impl Dimension {
    /// The rendered expression. Conditional wins over combine wins over
    /// expr; a bare dimension falls back to a column of the same name.
    pub fn output_expr(&self) -> Expr {
        if let Some(cond) = &self.conditional {
            return cond.to_expr();
        }
        if let Some(combine) = &self.combine {
            return Expr::Func {
                func: Function::ConcatWs {
                    sep: combine.delimiter.clone(),
                },
                args: combine
                    .columns
                    .iter()
                    .map(|c| Expr::Column { column: c.clone() })
                    .collect(),
            };
        }
        match &self.expr {
            Some(expr) => expr.clone(),
            None => Expr::Column {
                column: self.name.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CombineSpec {
    pub columns: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    " ".to_string()
}

/// An ordered CASE tree: (predicate, result) branches plus a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conditional {
    pub branches: Vec<CaseBranch>,
    pub else_expr: Expr,
}

impl Conditional {
    pub fn to_expr(&self) -> Expr {
        Expr::Case {
            branches: self.branches.clone(),
            else_expr: Box::new(self.else_expr.clone()),
        }
    }
}

/// A row- or group-level predicate attached to the metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub name: String,
    pub expr: Expr,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub filter_type: FilterType,
    #[serde(default = "default_true")]
    pub active: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    #[default]
    Where,
    Having,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "ilike")]
    ILike,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "is null")]
    IsNull,
    #[serde(rename = "is not null")]
    IsNotNull,
}

/// A join edge in the metric's join graph.
///
/// `left` must be the base table or the right side of an earlier join;
/// the compiler rejects unreachable edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Join {
    pub name: String,
    pub join_type: JoinType,
    pub left: String,
    pub right: String,
    pub on: Vec<JoinKey>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinKey {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

/// A runtime input referenced via `{{ name }}` placeholders.
///
/// Names starting with `ctx.` are reserved: they resolve from the
/// consumer-context provider, never from explicit caller input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    pub description: Option<String>,
}

/// Prefix marking consumer-context parameters.
pub const CONTEXT_PREFIX: &str = "ctx.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Bool,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderItem {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Output formatting rules carried as metadata; never rendered into SQL.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FormatSpec {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Column {
        column: String,
    },
    Literal {
        value: Value,
    },
    Func {
        func: Function,
        args: Vec<Expr>,
    },
    Case {
        branches: Vec<CaseBranch>,
        else_expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Expr::Column { column: s }),
            other => {
                #[derive(Deserialize)]
                #[serde(tag = "type", rename_all = "snake_case")]
                enum TaggedExpr {
                    Column {
                        column: String,
                    },
                    Literal {
                        value: Value,
                    },
                    Func {
                        func: Function,
                        args: Vec<Expr>,
                    },
                    Case {
                        branches: Vec<CaseBranch>,
                        else_expr: Box<Expr>,
                    },
                    Binary {
                        op: BinaryOp,
                        left: Box<Expr>,
                        right: Box<Expr>,
                    },
                }
                let tagged: TaggedExpr =
                    TaggedExpr::deserialize(other).map_err(de::Error::custom)?;
                Ok(match tagged {
                    TaggedExpr::Column { column } => Expr::Column { column },
                    TaggedExpr::Literal { value } => Expr::Literal { value },
                    TaggedExpr::Func { func, args } => Expr::Func { func, args },
                    TaggedExpr::Case {
                        branches,
                        else_expr,
                    } => Expr::Case {
                        branches,
                        else_expr,
                    },
                    TaggedExpr::Binary { op, left, right } => Expr::Binary { op, left, right },
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseBranch {
    pub when: Expr,
    pub then: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    // === Date/Time ===
    DateTrunc(TimeGrain),
    DatePart { field: String },
    Now,
    CurrentDate,

    // === String ===
    Lower,
    Upper,
    Concat,
    ConcatWs { sep: String },
    Substring,
    Length,
    Trim,

    // === Null handling ===
    Coalesce,
    IfNull,
    NullIf,

    // === Math ===
    Greatest,
    Least,
    SafeDivide,
    Abs,
    Round,

    // === Type conversion ===
    Cast { data_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
    /// Engine-specific aggregation function, rendered verbatim.
    Custom { function: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

// ============================================================================
// Derived entities
// ============================================================================

/// A computed column layered over the metric's measures: either an
/// arithmetic combination of two measures or a window function over one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DerivedEntity {
    pub name: String,
    pub derivation: Derivation,
    /// Source measure the derivation is computed over.
    pub measure: String,
    /// Second operand for arithmetic derivations.
    #[serde(default)]
    pub second_measure: Option<String>,
    /// Dimension names partitioning the window.
    #[serde(default)]
    pub partition_by: Vec<String>,
    /// Dimension names ordering the window. Required for window kinds.
    #[serde(default)]
    pub order_by: Vec<String>,
    /// Row offset for lag/lead.
    #[serde(default)]
    pub offset: Option<i64>,
    /// Bucket count for ntile, position for nth_value, window size for
    /// moving_average.
    #[serde(default)]
    pub n: Option<u64>,
    /// Fallback for missing-row cases (lag/lead beyond the frame).
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub format: Option<FormatSpec>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    // Arithmetic over two measures
    Divide,
    Multiply,
    Add,
    Subtract,
    // Window analytics over one measure
    RunningTotal,
    PercentOfTotal,
    Rank,
    DenseRank,
    RowNumber,
    Lag,
    Lead,
    Ntile,
    NthValue,
    MovingAverage,
}

impl Derivation {
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Derivation::Divide | Derivation::Multiply | Derivation::Add | Derivation::Subtract
        )
    }

    pub fn is_window(&self) -> bool {
        !self.is_arithmetic()
    }
}

// ============================================================================
// Variants, overrides, modifiers
// ============================================================================

/// A metric composed from another metric via overrides and derivations.
///
/// Variants are resolved into an effective [`SemanticMetric`] at execution
/// time; the source metric is never mutated or shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricVariant {
    pub name: String,
    pub source: MetricRef,
    /// Allow-list of base components, applied before overrides.
    #[serde(default)]
    pub include: Option<IncludeList>,
    #[serde(default)]
    pub overrides: MetricOverrides,
    #[serde(default)]
    pub derived: Vec<DerivedEntity>,
    /// Additional metrics whose components are merged in via a join.
    #[serde(default)]
    pub combine: Vec<CombineMetric>,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricRef {
    Id(String),
    Inline(Box<SemanticMetric>),
}

impl<'de> Deserialize<'de> for MetricRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(MetricRef::Id(s)),
            other => {
                let metric: SemanticMetric =
                    serde_json::from_value(other).map_err(de::Error::custom)?;
                Ok(MetricRef::Inline(Box::new(metric)))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IncludeList {
    #[serde(default)]
    pub measures: Option<Vec<String>>,
    #[serde(default)]
    pub dimensions: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Option<Vec<String>>,
    #[serde(default)]
    pub joins: Option<Vec<String>>,
}

/// Typed overrides. Application order is exclude, replace, add, config,
/// so an excluded name can be re-added without conflict.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MetricOverrides {
    #[serde(default)]
    pub add: ComponentSet,
    #[serde(default)]
    pub replace: ComponentSet,
    #[serde(default)]
    pub exclude: ExcludeSet,
    #[serde(default)]
    pub config: ConfigOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ComponentSet {
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ExcludeSet {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub joins: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// Scalar field overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub grouped: Option<bool>,
    #[serde(default)]
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CombineMetric {
    pub metric: String,
    pub join: Join,
}

/// Ad-hoc per-execution overrides, applied as upserts by name.
///
/// Modifiers never delete components: absence means "keep base".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ModifierSet {
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub order: Option<Vec<OrderItem>>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl ModifierSet {
    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
            && self.dimensions.is_empty()
            && self.filters.is_empty()
            && self.joins.is_empty()
            && self.order.is_none()
            && self.limit.is_none()
    }
}
