//! Reference rewriting.
//!
//! For each `${ref(name)...}` token in an expression: a Metric or Dimension
//! expands to its underlying expression (recursively, before anything else),
//! an Input rewrites to the deferred `${name[.accessor]}` placeholder form,
//! and a Model is recorded but left in place for later qualification against
//! the schema cache. Rewriting is idempotent: placeholders and model tokens
//! survive a second pass unchanged.

use strsim::levenshtein;

use crate::dag::{Entity, INPUT_ACCESSORS, ProjectDag};
use crate::error::{Error, Result};
use crate::refs::{placeholder, replace_span, scan_refs};

/// Macro expansion depth limit; cycles surface as errors, not hangs.
const MAX_MACRO_DEPTH: usize = 32;

/// A recorded `${ref(model)[.column]}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub model: String,
    pub column: Option<String>,
}

/// A recorded `${ref(input)[.accessor]}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRef {
    pub input: String,
    pub accessor: Option<String>,
}

/// The outcome of rewriting one expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    /// Expression text with inputs deferred and macros expanded; model
    /// reference tokens remain for the qualification step.
    pub text: String,
    pub model_refs: Vec<ModelRef>,
    pub input_refs: Vec<InputRef>,
}

impl Rewritten {
    pub fn references_models(&self) -> bool {
        !self.model_refs.is_empty()
    }

    pub fn references_inputs(&self) -> bool {
        !self.input_refs.is_empty()
    }
}

/// Rewrite every reference token in `expr` against `dag`.
pub fn rewrite(expr: &str, dag: &ProjectDag) -> Result<Rewritten> {
    let mut text = expr.to_string();

    for _ in 0..MAX_MACRO_DEPTH {
        let tokens = scan_refs(&text)?;

        // Macros first: expansion introduces new tokens, so re-scan after.
        let mut expanded_macro = false;
        for token in tokens.iter().rev() {
            let expansion = match dag.get_by_name(&token.name)? {
                Entity::Metric(metric) => Some(metric.expression.clone()),
                Entity::Dimension(dimension) => Some(dimension.expression.clone()),
                Entity::Model(_) | Entity::Input(_) => None,
            };
            if let Some(expression) = expansion {
                // Parenthesized so the expansion keeps its precedence.
                text = replace_span(&text, &token.span, &format!("({expression})"));
                expanded_macro = true;
            }
        }
        if expanded_macro {
            continue;
        }

        // No macros left: defer inputs, record models, and finish.
        let mut model_refs = Vec::new();
        let mut input_refs = Vec::new();
        for token in tokens.iter().rev() {
            match dag.get_by_name(&token.name)? {
                Entity::Model(_) => {
                    let reference = ModelRef {
                        model: token.name.clone(),
                        column: token.accessor.clone(),
                    };
                    if !model_refs.contains(&reference) {
                        model_refs.push(reference);
                    }
                }
                Entity::Input(_) => {
                    if let Some(accessor) = &token.accessor {
                        if !INPUT_ACCESSORS.contains(&accessor.as_str()) {
                            return Err(Error::ReferenceNotFound {
                                name: format!("{}.{accessor}", token.name),
                                suggestion: closest_accessor(accessor),
                            });
                        }
                    }
                    let reference = InputRef {
                        input: token.name.clone(),
                        accessor: token.accessor.clone(),
                    };
                    if !input_refs.contains(&reference) {
                        input_refs.push(reference);
                    }
                    text = replace_span(
                        &text,
                        &token.span,
                        &placeholder(&token.name, token.accessor.as_deref()),
                    );
                }
                Entity::Metric(_) | Entity::Dimension(_) => unreachable!("macros expanded above"),
            }
        }
        model_refs.reverse();
        input_refs.reverse();
        return Ok(Rewritten {
            text,
            model_refs,
            input_refs,
        });
    }

    Err(Error::ReferenceCycle {
        name: expr.to_string(),
    })
}

fn closest_accessor(accessor: &str) -> Option<String> {
    INPUT_ACCESSORS
        .iter()
        .map(|candidate| (levenshtein(accessor, candidate), *candidate))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}
