//! Column lineage extraction over compiled SELECT statements.
//!
//! Read-only sqlparser walk reporting what a statement produces (projection
//! aliases), what it consumes (identifiers across projection, WHERE,
//! GROUP BY, HAVING and ORDER BY) and which relations it touches, with CTE
//! names kept apart from base tables. The compiler logs this at debug level
//! for every `pre_query`; callers can use it for impact analysis.

use sqlparser::ast::{
    Expr, GroupByExpr, OrderByKind, Query, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::parser::Parser;

use crate::dialect::Dialect;
use crate::error::{Error, Result};

/// What one SELECT statement reads and produces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Lineage {
    /// Projection output names: the alias when present, otherwise the
    /// rendered expression.
    pub output_columns: Vec<String>,
    /// Every column identifier consumed, dotted paths joined.
    pub input_columns: Vec<String>,
    /// Base relations referenced in FROM/JOIN factors.
    pub tables: Vec<String>,
    /// Common table expression names defined by the statement.
    pub ctes: Vec<String>,
}

/// Extract lineage from one SELECT statement.
pub fn lineage(sql: &str, dialect: Dialect) -> Result<Lineage> {
    let parser_dialect = dialect.parser();
    let statement = Parser::new(&*parser_dialect)
        .try_with_sql(sql)
        .map_err(|e| Error::parse(dialect.name(), e))?
        .parse_statement()
        .map_err(|e| Error::parse(dialect.name(), e))?;

    let Statement::Query(query) = statement else {
        return Err(Error::parse(dialect.name(), "expected a SELECT statement"));
    };

    let mut lineage = Lineage::default();
    walk_query(&query, &mut lineage);

    // Relations resolving to a CTE are not base tables.
    let ctes = lineage.ctes.clone();
    lineage
        .tables
        .retain(|table| !ctes.iter().any(|cte| unquoted(table) == *cte));
    Ok(lineage)
}

fn walk_query(query: &Query, out: &mut Lineage) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            push_unique(&mut out.ctes, cte.alias.name.value.clone());
            walk_query(&cte.query, out);
        }
    }

    if let SetExpr::Select(select) = query.body.as_ref() {
        for item in &select.projection {
            let name = match item {
                SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
                other => other.to_string(),
            };
            push_unique(&mut out.output_columns, name);
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    collect_idents(expr, &mut out.input_columns);
                }
                _ => {}
            }
        }
        for table in &select.from {
            walk_table(table, out);
        }
        if let Some(selection) = &select.selection {
            collect_idents(selection, &mut out.input_columns);
        }
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                collect_idents(expr, &mut out.input_columns);
            }
        }
        if let Some(having) = &select.having {
            collect_idents(having, &mut out.input_columns);
        }
    }

    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            for order_expr in exprs {
                collect_idents(&order_expr.expr, &mut out.input_columns);
            }
        }
    }
}

fn walk_table(table: &TableWithJoins, out: &mut Lineage) {
    walk_factor(&table.relation, out);
    for join in &table.joins {
        walk_factor(&join.relation, out);
    }
}

fn walk_factor(factor: &TableFactor, out: &mut Lineage) {
    match factor {
        TableFactor::Table { name, .. } => push_unique(&mut out.tables, name.to_string()),
        TableFactor::Derived { subquery, .. } => walk_query(subquery, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table(table_with_joins, out),
        _ => {}
    }
}

/// Collect column identifiers out of an expression tree.
fn collect_idents(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Identifier(ident) => push_unique(out, ident.value.clone()),
        Expr::CompoundIdentifier(idents) => {
            let path: Vec<&str> = idents.iter().map(|i| i.value.as_str()).collect();
            push_unique(out, path.join("."));
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_idents(left, out);
            collect_idents(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::Cast { expr, .. }
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr) => collect_idents(expr, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_idents(expr, out);
            collect_idents(low, out);
            collect_idents(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_idents(expr, out);
            for item in list {
                collect_idents(item, out);
            }
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            collect_idents(expr, out);
            collect_idents(pattern, out);
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                collect_idents(operand, out);
            }
            for when in conditions {
                collect_idents(&when.condition, out);
                collect_idents(&when.result, out);
            }
            if let Some(else_result) = else_result {
                collect_idents(else_result, out);
            }
        }
        Expr::Function(function) => {
            use sqlparser::ast::{FunctionArg, FunctionArgExpr, FunctionArguments};
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(inner))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(inner),
                        ..
                    } = arg
                    {
                        collect_idents(inner, out);
                    }
                }
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                collect_idents(item, out);
            }
        }
        _ => {}
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn unquoted(name: &str) -> &str {
    name.trim_matches('"').trim_matches('`')
}
