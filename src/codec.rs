//! Placeholder round-trip codec.
//!
//! Deferred placeholders (`${name.accessor}`) are not valid SQL, so the
//! parser used for classification and clause building cannot read them. The
//! codec substitutes a representative sample literal for each placeholder,
//! immediately followed by an inert comment marker recording the original
//! token, e.g. `100 /* __INPUT:threshold.value__ */`. After assembly the
//! markers are decoded back into token form. Because the marker travels
//! attached to the literal rather than being tracked by AST node identity,
//! the round trip survives the literal being re-wrapped (CAST, CASE, ...).
//!
//! Dynamic-mode model column references ride the same mechanism with a
//! `__MODELREF:model.column__` marker so a client-evaluated query keeps its
//! `${ref(model).column}` tokens through assembly.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::dag::ProjectDag;
use crate::error::{Error, Result};
use crate::refs::{placeholder, ref_token, scan_placeholders, replace_span};

/// One placeholder-to-literal substitution performed by `encode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    /// The `name[.accessor]` path inside the original token.
    pub path: String,
    pub literal: String,
}

/// An expression with placeholders made parseable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub sql: String,
    pub substitutions: Vec<Substitution>,
}

/// Attach an input marker to a literal.
pub fn mark_input(literal: &str, path: &str) -> String {
    format!("{literal} /* __INPUT:{path}__ */")
}

/// Attach a model-reference marker to a qualified column.
pub fn mark_model_column(rendered: &str, model: &str, column: &str) -> String {
    format!("{rendered} /* __MODELREF:{model}.{column}__ */")
}

/// Replace every deferred placeholder in `expr` with a sample literal plus
/// marker. `samples` carries literals resolved at compile time (query-derived
/// input options); inputs absent from it fall back to their first static
/// option or default.
pub fn encode(
    expr: &str,
    dag: &ProjectDag,
    samples: &HashMap<String, String>,
) -> Result<Encoded> {
    let tokens = scan_placeholders(expr);
    let mut sql = expr.to_string();
    let mut substitutions = Vec::new();

    for token in tokens.iter().rev() {
        let input = dag
            .get_input(&token.name)
            .ok_or_else(|| Error::UndefinedInput {
                name: token.name.clone(),
            })?;
        let literal = match samples.get(&token.name) {
            Some(literal) => literal.clone(),
            None => input.sample_literal().ok_or_else(|| Error::InputQuery {
                input: token.name.clone(),
                message: "has no static option or default to sample".to_string(),
            })?,
        };
        let path = token.path();
        sql = replace_span(&sql, &token.span, &mark_input(&literal, &path));
        substitutions.push(Substitution { path, literal });
    }

    substitutions.reverse();
    Ok(Encoded { sql, substitutions })
}

/// `literal-or-identifier` + marker, tolerant of whatever the assembly
/// wrapped around the literal. Ordinary comments never match.
static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?P<lit>
            '(?:[^']|'')*'                                    # string literal
          | -?\d+(?:\.\d+)?                                   # number
          | (?i:TRUE|FALSE|NULL)                              # keyword literal
          | (?:"[^"]*"|`[^`]*`|[A-Za-z_][A-Za-z0-9_]*)        # identifier path
            (?:\.(?:"[^"]*"|`[^`]*`|[A-Za-z_][A-Za-z0-9_]*))*
        )
        \s*/\*\s*__(?P<kind>INPUT|MODELREF):(?P<path>[A-Za-z0-9_][A-Za-z0-9_.\- ]*)__\s*\*/
        "#,
    )
    .expect("marker regex is valid")
});

/// Restore every literal-plus-marker pair in `rendered` to token form.
///
/// A marker naming an Input absent from the dependency graph is an
/// `UndefinedInput` error.
pub fn decode(rendered: &str, dag: &ProjectDag) -> Result<String> {
    let mut out = String::with_capacity(rendered.len());
    let mut last = 0;

    for caps in MARKER.captures_iter(rendered) {
        let whole = caps.get(0).expect("match exists");
        let kind = &caps["kind"];
        let path = &caps["path"];

        let restored = match kind {
            "INPUT" => {
                let (name, accessor) = match path.split_once('.') {
                    Some((name, accessor)) => (name, Some(accessor)),
                    None => (path, None),
                };
                if dag.get_input(name).is_none() {
                    return Err(Error::UndefinedInput {
                        name: name.to_string(),
                    });
                }
                placeholder(name, accessor)
            }
            _ => {
                let (model, column) = path.split_once('.').ok_or_else(|| Error::Parse {
                    dialect: "codec".to_string(),
                    message: format!("model marker '{path}' is missing a column"),
                })?;
                ref_token(model, Some(column))
            }
        };

        out.push_str(&rendered[last..whole.start()]);
        out.push_str(&restored);
        last = whole.end();
    }

    out.push_str(&rendered[last..]);
    Ok(out)
}
