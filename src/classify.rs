//! Statement classification: vanilla, aggregate, or window.
//!
//! Clause assembly depends on this split: vanilla filters go to WHERE,
//! aggregate filters to HAVING, and window expressions are excluded from
//! GROUP BY. A windowing construct dominates (`SUM(x) OVER (...)` is a
//! window call, not an aggregate), and wrapping an aggregate in a plain
//! function (`ROUND(STDDEV_POP(y), 2)`) still counts as aggregate.

use sqlparser::ast::{CaseWhen, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments};
use sqlparser::parser::Parser;

use crate::dialect::Dialect;
use crate::error::{Error, Result};

/// Aggregation behavior of one expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Vanilla,
    Aggregate,
    Window,
}

/// Parse a standalone expression in the given dialect.
pub fn parse_expression(sql: &str, dialect: Dialect) -> Result<Expr> {
    let parser_dialect = dialect.parser();
    Parser::new(&*parser_dialect)
        .try_with_sql(sql)
        .map_err(|e| Error::parse(dialect.name(), e))?
        .parse_expr()
        .map_err(|e| Error::parse(dialect.name(), e))
}

/// Classify an expression string. Unparsable input fails fast.
pub fn classify(sql: &str, dialect: Dialect) -> Result<StatementClass> {
    let expr = parse_expression(sql, dialect)?;
    Ok(classify_expr(&expr, dialect))
}

/// Classify an already-parsed expression.
pub fn classify_expr(expr: &Expr, dialect: Dialect) -> StatementClass {
    let mut walk = Walk {
        dialect,
        saw_aggregate: false,
        saw_window: false,
    };
    walk.visit(expr);
    if walk.saw_window {
        StatementClass::Window
    } else if walk.saw_aggregate {
        StatementClass::Aggregate
    } else {
        StatementClass::Vanilla
    }
}

struct Walk {
    dialect: Dialect,
    saw_aggregate: bool,
    saw_window: bool,
}

impl Walk {
    fn visit(&mut self, expr: &Expr) {
        match expr {
            Expr::Function(func) => self.visit_function(func),
            Expr::BinaryOp { left, right, .. } => {
                self.visit(left);
                self.visit(right);
            }
            Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
                self.visit(expr)
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.visit(expr);
                self.visit(low);
                self.visit(high);
            }
            Expr::InList { expr, list, .. } => {
                self.visit(expr);
                for item in list {
                    self.visit(item);
                }
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.visit(expr);
                self.visit(pattern);
            }
            Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotFalse(expr) => self.visit(expr),
            Expr::IsDistinctFrom(a, b) | Expr::IsNotDistinctFrom(a, b) => {
                self.visit(a);
                self.visit(b);
            }
            Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                if let Some(operand) = operand {
                    self.visit(operand);
                }
                for CaseWhen { condition, result } in conditions {
                    self.visit(condition);
                    self.visit(result);
                }
                if let Some(else_result) = else_result {
                    self.visit(else_result);
                }
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.visit(item);
                }
            }
            // An aggregate inside a scalar subquery aggregates in its own
            // scope, not this one.
            Expr::Subquery(_) | Expr::Exists { .. } => {}
            Expr::InSubquery { expr, .. } => self.visit(expr),
            _ => {}
        }
    }

    fn visit_function(&mut self, func: &Function) {
        if func.over.is_some() {
            self.saw_window = true;
        } else if self.dialect.is_aggregate_function(&func.name.to_string()) {
            self.saw_aggregate = true;
        }
        if let FunctionArguments::List(list) = &func.args {
            for arg in &list.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => self.visit(e),
                    FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } => self.visit(e),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_arithmetic_is_vanilla() {
        assert_eq!(
            classify("x + 1", Dialect::Generic).unwrap(),
            StatementClass::Vanilla
        );
    }

    #[test]
    fn test_aggregate_call() {
        assert_eq!(
            classify("SUM(x)", Dialect::Generic).unwrap(),
            StatementClass::Aggregate
        );
    }

    #[test]
    fn test_window_dominates_aggregate() {
        assert_eq!(
            classify("SUM(x) OVER (PARTITION BY y)", Dialect::Generic).unwrap(),
            StatementClass::Window
        );
    }

    #[test]
    fn test_wrapped_aggregate_is_still_aggregate() {
        assert_eq!(
            classify("ROUND(STDDEV_POP(y), 2)", Dialect::Generic).unwrap(),
            StatementClass::Aggregate
        );
    }

    #[test]
    fn test_aggregate_in_case_branch() {
        assert_eq!(
            classify(
                "CASE WHEN SUM(amount) > 100 THEN 'hi' ELSE 'lo' END",
                Dialect::Generic
            )
            .unwrap(),
            StatementClass::Aggregate
        );
    }

    #[test]
    fn test_dialect_specific_aggregate() {
        assert_eq!(
            classify("GROUP_CONCAT(name)", Dialect::Mysql).unwrap(),
            StatementClass::Aggregate
        );
        assert_eq!(
            classify("GROUP_CONCAT(name)", Dialect::Postgres).unwrap(),
            StatementClass::Vanilla
        );
    }

    #[test]
    fn test_row_number_is_window() {
        assert_eq!(
            classify("ROW_NUMBER() OVER (ORDER BY created_at)", Dialect::Generic).unwrap(),
            StatementClass::Window
        );
    }

    #[test]
    fn test_aggregate_inside_subquery_does_not_leak() {
        assert_eq!(
            classify("x IN (SELECT MAX(y) FROM t)", Dialect::Generic).unwrap(),
            StatementClass::Vanilla
        );
    }

    #[test]
    fn test_unparsable_input_fails_fast() {
        let err = classify("SUM(", Dialect::Generic).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
