//! Clause assembly: a `SelectPlan` flows through pure transformation stages
//! (filters, group by, order by) and renders to dialect-correct SQL.
//!
//! The stages never mutate shared state; each takes and returns the plan, so
//! every stage is independently testable. Rendering builds the statement by
//! string assembly with dialect-normalized identifiers; sqlparser is used
//! read-only, for ORDER BY base-column extraction and literal detection.

use sqlparser::ast::{Expr, Value, ValueWithSpan};

use crate::classify::{StatementClass, parse_expression};
use crate::dialect::Dialect;

/// A named sub-query heading the compiled statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cte {
    pub name: String,
    pub body: String,
}

/// One select-list item: resolved expression, stable alias, classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectItem {
    pub expr: String,
    pub alias: String,
    pub class: StatementClass,
}

/// One filter interaction, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterItem {
    pub expr: String,
    pub class: StatementClass,
}

/// The split/cohort interaction's compiled column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitItem {
    pub alias: String,
    /// String-literal splits never join the GROUP BY key.
    pub is_literal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Asc => " ASC",
            Self::Desc => " DESC",
        }
    }
}

/// One sort interaction with its direction suffix split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub expr: String,
    pub direction: Option<SortDirection>,
}

impl OrderItem {
    /// Split a bare trailing ASC/DESC off a sort expression. The suffix must
    /// come off before parsing (the parser would misread it as a trailing
    /// alias) and is re-appended after qualification.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(expr) = strip_direction(trimmed, " desc") {
            return Self {
                expr,
                direction: Some(SortDirection::Desc),
            };
        }
        if let Some(expr) = strip_direction(trimmed, " asc") {
            return Self {
                expr,
                direction: Some(SortDirection::Asc),
            };
        }
        Self {
            expr: trimmed.to_string(),
            direction: None,
        }
    }
}

/// Strip a trailing direction keyword case-insensitively on the original
/// bytes; lowercasing the whole expression first can shift byte lengths for
/// multibyte identifiers. `get` keeps a mid-character cut from panicking.
fn strip_direction(text: &str, suffix: &str) -> Option<String> {
    let cut = text.len().checked_sub(suffix.len())?;
    let tail = text.get(cut..)?;
    tail.eq_ignore_ascii_case(suffix)
        .then(|| text[..cut].trim_end().to_string())
}

/// The assembled-but-unrendered outer SELECT.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectPlan {
    pub dialect: Option<Dialect>,
    pub ctes: Vec<Cte>,
    pub items: Vec<SelectItem>,
    /// Rendered relation references, comma-joined in FROM order.
    pub from: Vec<String>,
    pub filters: Vec<FilterItem>,
    pub split: Option<SplitItem>,
    pub order: Vec<OrderItem>,

    // Filled by the stages below.
    pub where_predicates: Vec<String>,
    pub having_predicates: Vec<String>,
    pub group_by: Vec<String>,
    pub order_rendered: Vec<String>,
}

impl SelectPlan {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect: Some(dialect),
            ..Self::default()
        }
    }

    fn dialect(&self) -> Dialect {
        self.dialect.unwrap_or(Dialect::Generic)
    }
}

/// WHERE folds vanilla filters; HAVING folds aggregate ones. Neither clause
/// ever sees the other's class.
pub fn apply_filters(mut plan: SelectPlan) -> SelectPlan {
    for filter in &plan.filters {
        match filter.class {
            StatementClass::Vanilla => plan.where_predicates.push(filter.expr.clone()),
            StatementClass::Aggregate => plan.having_predicates.push(filter.expr.clone()),
            StatementClass::Window => {}
        }
    }
    plan
}

/// GROUP BY triggers iff the select list mixes at least one aggregate with
/// at least one non-aggregate, non-window item. The key collects the
/// dialect-quoted alias of every vanilla item, plus the split column's alias
/// when present and not a string literal.
pub fn apply_group_by(mut plan: SelectPlan) -> SelectPlan {
    let dialect = plan.dialect();
    // A literal split column is constant per row, so it neither triggers
    // grouping nor joins the key.
    let literal_split = |item: &SelectItem| {
        plan.split
            .as_ref()
            .is_some_and(|split| split.is_literal && split.alias == item.alias)
    };
    let has_aggregate = plan
        .items
        .iter()
        .any(|item| item.class == StatementClass::Aggregate);
    let has_plain = plan
        .items
        .iter()
        .any(|item| item.class == StatementClass::Vanilla && !literal_split(item));
    if !(has_aggregate && has_plain) {
        return plan;
    }

    let mut keys: Vec<String> = Vec::new();
    for item in &plan.items {
        if item.class == StatementClass::Vanilla && !literal_split(item) {
            let quoted = dialect.normalize_identifier(&item.alias);
            if !keys.contains(&quoted) {
                keys.push(quoted);
            }
        }
    }
    if let Some(split) = &plan.split {
        if !split.is_literal {
            let quoted = dialect.normalize_identifier(&split.alias);
            if !keys.contains(&quoted) {
                keys.push(quoted);
            }
        }
    }
    plan.group_by = keys;
    plan
}

/// Under an active GROUP BY, a raw column in an ORDER BY item is rewritten
/// to the matching SELECT-list alias, so "order by pre-aggregation column"
/// still works post-grouping. Matching reaches through simple CAST wrappers
/// only; deeper expression trees are left as written.
pub fn apply_order_by(mut plan: SelectPlan) -> SelectPlan {
    let dialect = plan.dialect();
    let mut rendered = Vec::new();
    for order in &plan.order {
        let mut expr = order.expr.clone();
        if !plan.group_by.is_empty() {
            if let Some(column) = base_column(&order.expr, dialect) {
                if let Some(alias) = matching_alias(&plan.items, &column) {
                    expr = dialect.normalize_identifier(alias);
                }
            }
        }
        if let Some(direction) = order.direction {
            expr.push_str(direction.suffix());
        }
        rendered.push(expr);
    }
    plan.order_rendered = rendered;
    plan
}

/// The full pipeline in clause order.
pub fn assemble(plan: SelectPlan) -> SelectPlan {
    apply_order_by(apply_group_by(apply_filters(plan)))
}

/// Render an assembled plan as one SELECT statement.
pub fn render(plan: &SelectPlan) -> String {
    let dialect = plan.dialect();
    let mut sql = String::new();

    if !plan.ctes.is_empty() {
        let parts: Vec<String> = plan
            .ctes
            .iter()
            .map(|cte| {
                format!(
                    "{} AS ({})",
                    dialect.normalize_identifier(&cte.name),
                    cte.body
                )
            })
            .collect();
        sql.push_str(&format!("WITH {} ", parts.join(", ")));
    }

    sql.push_str("SELECT ");
    if plan.items.is_empty() {
        sql.push('*');
    } else {
        let cols: Vec<String> = plan
            .items
            .iter()
            .map(|item| {
                format!(
                    "{} AS {}",
                    item.expr,
                    dialect.normalize_identifier(&item.alias)
                )
            })
            .collect();
        sql.push_str(&cols.join(", "));
    }

    if !plan.from.is_empty() {
        sql.push_str(&format!(" FROM {}", plan.from.join(", ")));
    }
    if !plan.where_predicates.is_empty() {
        sql.push_str(&format!(" WHERE {}", plan.where_predicates.join(" AND ")));
    }
    if !plan.group_by.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", plan.group_by.join(", ")));
    }
    if !plan.having_predicates.is_empty() {
        sql.push_str(&format!(" HAVING {}", plan.having_predicates.join(" AND ")));
    }
    if !plan.order_rendered.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", plan.order_rendered.join(", ")));
    }
    sql
}

/// The base column under an expression, reaching through CASTs and nesting.
fn base_column(expr_sql: &str, dialect: Dialect) -> Option<String> {
    let mut expr = parse_expression(expr_sql, dialect).ok()?;
    loop {
        match expr {
            Expr::Cast { expr: inner, .. } | Expr::Nested(inner) => expr = *inner,
            Expr::Identifier(ident) => return Some(ident.value),
            Expr::CompoundIdentifier(mut idents) => {
                return idents.pop().map(|ident| ident.value);
            }
            _ => return None,
        }
    }
}

/// The alias of the select item whose expression bottoms out at `column`,
/// or whose alias already is `column`.
fn matching_alias<'a>(items: &'a [SelectItem], column: &str) -> Option<&'a str> {
    for item in items {
        if item.alias == column {
            return Some(&item.alias);
        }
    }
    for item in items {
        if let Some(base) = base_column(&item.expr, Dialect::Generic) {
            if base == column {
                return Some(&item.alias);
            }
        }
    }
    None
}

/// Whether an expression is a bare string literal.
pub fn is_string_literal(expr_sql: &str, dialect: Dialect) -> bool {
    matches!(
        parse_expression(expr_sql, dialect),
        Ok(Expr::Value(ValueWithSpan {
            value: Value::SingleQuotedString(_) | Value::DoubleQuotedString(_),
            ..
        }))
    )
}
