//! The Insight query compiler.
//!
//! Turns one declarative `Insight` into a `QueryInfo`: an optional
//! server-side `pre_query` in the backend's dialect plus a client-side
//! `post_query` for the embedded engine. An insight whose query expressions
//! transitively reference an Input cannot be pre-computed, so it compiles
//! dynamic: no `pre_query`, and the `post_query` keeps deferred
//! `${name}` placeholders and `${ref(model).column}` tokens for the client
//! execution layer to resolve per interaction.

mod props;
mod relation;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strsim::levenshtein;
use tracing::{debug, warn};

use crate::clauses::{self, FilterItem, OrderItem, SelectItem, SelectPlan, SplitItem};
use crate::classify::{StatementClass, classify};
use crate::codec::{self, mark_model_column};
use crate::dag::{Input, InputOptions, Insight, Interaction, Model, ProjectDag};
use crate::dialect::{CLIENT_DIALECT, Dialect};
use crate::error::{CompileError, CompileResult, Error, Result};
use crate::lineage;
use crate::refs::rewriter::{self, Rewritten};
use crate::refs::{replace_span, scan_refs};
use crate::schema::{Backends, ColumnSchema, SchemaCache};

pub use relation::{column_alias, insight_file, model_query_name};

/// The compiled artifact for one insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    /// Server-side SELECT in the backend's dialect; absent for dynamic
    /// insights.
    pub pre_query: Option<String>,
    /// Client-side SELECT, always in the embedded engine's dialect.
    pub post_query: String,
    /// Prop/column path -> select-list alias, for every query expression.
    pub props_mapping: BTreeMap<String, String>,
    /// Prop tree minus query expressions, inputs deferred.
    pub static_props: serde_json::Value,
    /// Alias of the split/cohort column, when the insight has one.
    pub split_key: Option<String>,
}

impl QueryInfo {
    pub fn is_dynamic(&self) -> bool {
        self.pre_query.is_none()
    }
}

/// What role a compiled expression plays in the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Selected,
    Filter,
    Split,
    Sort,
}

/// One expression leaf after rewriting, with its provenance.
struct Compiled {
    path: String,
    raw: String,
    rewritten: Rewritten,
    role: Role,
}

/// Compiles insights against one project's entities, backends and schema
/// cache. Pure and reentrant; safe to share across threads.
pub struct Compiler<'a> {
    dag: &'a ProjectDag,
    backends: &'a Backends,
    schemas: &'a SchemaCache,
}

impl<'a> Compiler<'a> {
    pub fn new(dag: &'a ProjectDag, backends: &'a Backends, schemas: &'a SchemaCache) -> Self {
        Self {
            dag,
            backends,
            schemas,
        }
    }

    /// Compile one insight. Failures carry the insight name, the leaf path
    /// and the offending expression; sibling insights are unaffected.
    pub fn compile(&self, insight: &Insight) -> CompileResult<QueryInfo> {
        let fail = |path: &str, expr: &str, source: Error| {
            CompileError::new(insight.name.clone(), path, expr, source)
        };

        let model = self
            .dag
            .get_model(&insight.model)
            .map_err(|e| fail("model", &insight.model, e))?;

        // Rewrite every expression leaf up front; classification into query
        // expressions and static props depends on the recorded references.
        let mut compiled: Vec<Compiled> = Vec::new();
        for leaf in props::collect_leaves(&insight.props) {
            let rewritten = rewriter::rewrite(&leaf.expression, self.dag)
                .map_err(|e| fail(&leaf.path, &leaf.expression, e))?;
            compiled.push(Compiled {
                path: leaf.path,
                raw: leaf.expression,
                rewritten,
                role: Role::Selected,
            });
        }
        for (name, expression) in &insight.columns {
            let path = format!("columns.{name}");
            let rewritten =
                rewriter::rewrite(expression, self.dag).map_err(|e| fail(&path, expression, e))?;
            compiled.push(Compiled {
                path,
                raw: expression.clone(),
                rewritten,
                role: Role::Selected,
            });
        }
        for (i, interaction) in insight.interactions.iter().enumerate() {
            let path = format!("interactions[{i}]");
            let (raw, role) = match interaction {
                Interaction::Filter(expr) => (expr, Role::Filter),
                Interaction::Split(expr) => (expr, Role::Split),
                Interaction::Sort(expr) => (expr, Role::Sort),
            };
            let rewritten = rewriter::rewrite(raw, self.dag).map_err(|e| fail(&path, raw, e))?;
            compiled.push(Compiled {
                path,
                raw: raw.clone(),
                rewritten,
                role,
            });
        }

        // A prop or column leaf joins the query iff it references a model;
        // interactions always do. Everything else stays a static prop.
        let is_query = |c: &Compiled| c.role != Role::Selected || c.rewritten.references_models();
        // Dynamism looks at the whole tree: an Input referenced only from a
        // static prop still defers the compile to request time.
        let dynamic = compiled.iter().any(|c| c.rewritten.references_inputs());

        let backend = model
            .backing
            .resolve_source()
            .and_then(|source| self.backends.get(source));
        let dialect = if dynamic {
            CLIENT_DIALECT
        } else {
            backend
                .map(|b| Dialect::from_name(b.dialect()))
                .unwrap_or(CLIENT_DIALECT)
        };

        // Referenced models: the backing model first, extras in order of
        // first appearance.
        let mut models: Vec<&Model> = vec![model];
        for c in compiled.iter().filter(|c| is_query(c)) {
            for model_ref in &c.rewritten.model_refs {
                if models.iter().all(|m| m.name != model_ref.model) {
                    let extra = self
                        .dag
                        .get_model(&model_ref.model)
                        .map_err(|e| fail(&c.path, &c.raw, e))?;
                    models.push(extra);
                }
            }
        }

        // Inputs with query-derived options need their option query run
        // once; the first value becomes the codec sample literal.
        let mut samples: HashMap<String, String> = HashMap::new();
        for c in compiled.iter().filter(|c| is_query(c)) {
            for input_ref in &c.rewritten.input_refs {
                if samples.contains_key(&input_ref.input) {
                    continue;
                }
                let input = self
                    .dag
                    .get_input(&input_ref.input)
                    .ok_or_else(|| Error::UndefinedInput {
                        name: input_ref.input.clone(),
                    })
                    .map_err(|e| fail(&c.path, &c.raw, e))?;
                if let InputOptions::Query { .. } = &input.options {
                    let path = format!("inputs.{}", input.name);
                    let literal = self
                        .resolve_option_literal(input)
                        .map_err(|e| fail(&path, &input.name, e))?;
                    samples.insert(input.name.clone(), literal);
                }
            }
        }

        // Qualify model references, encode deferred inputs, classify, and
        // slot each expression into the plan.
        let mut plan = SelectPlan::new(dialect);
        let mut props_mapping = BTreeMap::new();
        let mut query_paths = BTreeSet::new();
        let mut split_key = None;
        for c in compiled.iter().filter(|c| is_query(c)) {
            let qualified = self
                .qualify(&c.rewritten.text, dynamic, dialect)
                .map_err(|e| fail(&c.path, &c.raw, e))?;
            let encoded = codec::encode(&qualified, self.dag, &samples)
                .map_err(|e| fail(&c.path, &c.raw, e))?;
            let class = classify(&encoded.sql, dialect).map_err(|e| fail(&c.path, &c.raw, e))?;
            // Aliases hash the qualified text, not the encoded one, so
            // sample literals never shift them between runs.
            let alias = relation::column_alias(&qualified);

            match c.role {
                Role::Selected => {
                    if plan.items.iter().all(|item| item.alias != alias) {
                        plan.items.push(SelectItem {
                            expr: encoded.sql,
                            alias: alias.clone(),
                            class,
                        });
                    }
                    props_mapping.insert(c.path.clone(), alias);
                    if c.path.starts_with("props") {
                        query_paths.insert(c.path.clone());
                    }
                }
                Role::Filter => {
                    if class == StatementClass::Window {
                        return Err(fail(
                            &c.path,
                            &c.raw,
                            Error::parse(
                                dialect.name(),
                                "window functions are not allowed in a filter",
                            ),
                        ));
                    }
                    plan.filters.push(FilterItem {
                        expr: encoded.sql,
                        class,
                    });
                }
                Role::Split => {
                    if plan.items.iter().all(|item| item.alias != alias) {
                        plan.items.push(SelectItem {
                            expr: encoded.sql.clone(),
                            alias: alias.clone(),
                            class,
                        });
                    }
                    plan.split = Some(SplitItem {
                        alias: alias.clone(),
                        is_literal: clauses::is_string_literal(&encoded.sql, dialect),
                    });
                    split_key = Some(alias);
                }
                Role::Sort => plan.order.push(OrderItem::parse(&encoded.sql)),
            }
        }

        plan.ctes = models
            .iter()
            .map(|m| relation::cte(m, dialect, dynamic))
            .collect();
        plan.from = models
            .iter()
            .map(|m| relation::from_entry(m, dialect))
            .collect();

        let rendered = clauses::render(&clauses::assemble(plan));
        match lineage::lineage(&rendered, dialect) {
            Ok(lin) => debug!(
                insight = %insight.name,
                outputs = ?lin.output_columns,
                tables = ?lin.tables,
                "compiled select"
            ),
            Err(err) => warn!(insight = %insight.name, %err, "lineage extraction failed"),
        }

        let static_props = props::static_props(&insight.props, &query_paths, self.dag)
            .map_err(|e| fail("props", "<static props>", e))?;

        if dynamic {
            let post_query =
                codec::decode(&rendered, self.dag).map_err(|e| fail("post_query", &rendered, e))?;
            Ok(QueryInfo {
                pre_query: None,
                post_query,
                props_mapping,
                static_props,
                split_key,
            })
        } else {
            let file = relation::insight_file(&insight.name, &rendered);
            Ok(QueryInfo {
                pre_query: Some(rendered),
                post_query: format!("SELECT * FROM '{file}'"),
                props_mapping,
                static_props,
                split_key,
            })
        }
    }

    /// Replace each remaining `${ref(model).column}` token with a rendered
    /// column reference. Non-dynamic compiles validate the column against
    /// the cached schema; dynamic compiles append a model-ref marker so the
    /// token survives the round trip to `post_query`.
    fn qualify(&self, text: &str, dynamic: bool, dialect: Dialect) -> Result<String> {
        let tokens = scan_refs(text)?;
        let mut out = text.to_string();
        for token in tokens.iter().rev() {
            let model = self.dag.get_model(&token.name)?;
            let column = token.accessor.as_deref().ok_or_else(|| {
                Error::parse(
                    dialect.name(),
                    format!(
                        "model reference '{}' needs a column accessor inside an expression",
                        token.name
                    ),
                )
            })?;
            let replacement = if dynamic {
                let rendered = dialect.normalize_path(&[&model.name, column]);
                mark_model_column(&rendered, &model.name, column)
            } else {
                self.qualify_against_schema(model, column, dialect)?
            };
            out = replace_span(&out, &token.span, &replacement);
        }
        Ok(out)
    }

    fn qualify_against_schema(
        &self,
        model: &Model,
        column: &str,
        dialect: Dialect,
    ) -> Result<String> {
        let schema = self.schema_of(model);
        if schema.is_empty() {
            // Probe failed or no backend: fall back to the bare column and
            // let the backend resolve it.
            return Ok(dialect.normalize_identifier(column));
        }
        match schema.keys().find(|k| k.eq_ignore_ascii_case(column)) {
            Some(actual) => Ok(dialect.normalize_path(&[&model.name, actual])),
            None => Err(Error::ReferenceNotFound {
                name: format!("{}.{}", model.name, column),
                suggestion: closest_column(&schema, column)
                    .map(|c| format!("{}.{}", model.name, c)),
            }),
        }
    }

    fn schema_of(&self, model: &Model) -> Arc<ColumnSchema> {
        let Some(source) = model.backing.resolve_source() else {
            return Arc::new(ColumnSchema::new());
        };
        match self.backends.get(source) {
            Some(backend) => self.schemas.schema_for(backend, source, model),
            None => {
                warn!(source, model = %model.name, "no backend registered, skipping schema probe");
                Arc::new(ColumnSchema::new())
            }
        }
    }

    /// Run a query-derived option list once and pick its first value as the
    /// sample literal. Zero rows or more than one column is a compile error.
    fn resolve_option_literal(&self, input: &Input) -> Result<String> {
        let InputOptions::Query { model, sql } = &input.options else {
            return Err(Error::InputQuery {
                input: input.name.clone(),
                message: "no query-derived options defined".to_string(),
            });
        };
        let model = self.dag.get_model(model)?;
        let source = model
            .backing
            .resolve_source()
            .ok_or_else(|| Error::InputQuery {
                input: input.name.clone(),
                message: format!("model '{}' has no backend connection", model.name),
            })?;
        let backend = self.backends.get(source).ok_or_else(|| Error::InputQuery {
            input: input.name.clone(),
            message: format!("backend '{source}' is not registered"),
        })?;
        let dialect = Dialect::from_name(backend.dialect());

        // Inline each referenced model as a derived table.
        let tokens = scan_refs(sql)?;
        let referenced: BTreeSet<&str> = tokens.iter().map(|t| t.name.as_str()).collect();
        if referenced.len() != 1 {
            return Err(Error::ReferenceArity {
                input: input.name.clone(),
                found: referenced.len(),
            });
        }
        let mut text = sql.clone();
        for token in tokens.iter().rev() {
            let referenced = self.dag.get_model(&token.name)?;
            let inlined = format!(
                "({}) AS {}",
                relation::trimmed_sql(&referenced.sql),
                dialect.normalize_identifier(&referenced.name)
            );
            text = replace_span(&text, &token.span, &inlined);
        }

        let result = backend.read_sql(&text).map_err(|err| Error::InputQuery {
            input: input.name.clone(),
            message: err.to_string(),
        })?;
        if result.columns.len() != 1 {
            return Err(Error::InputQuery {
                input: input.name.clone(),
                message: format!(
                    "option query returned {} columns, expected exactly 1",
                    result.columns.len()
                ),
            });
        }
        let first = result
            .rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| Error::InputQuery {
                input: input.name.clone(),
                message: "option query returned no rows".to_string(),
            })?;
        Ok(literal_from_value(first))
    }
}

/// Render a result cell as a SQL literal.
fn literal_from_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(true) => "TRUE".to_string(),
        serde_json::Value::Bool(false) => "FALSE".to_string(),
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => crate::dag::render_literal(s),
        other => crate::dag::render_literal(&other.to_string()),
    }
}

fn closest_column(schema: &ColumnSchema, column: &str) -> Option<String> {
    schema
        .keys()
        .map(|candidate| (levenshtein(column, candidate), candidate))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.clone())
}
