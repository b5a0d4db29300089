//! Relation naming and CTE construction for compiled insights.
//!
//! Names are content-hashed so two insights over the same model SQL share a
//! cache entry and any edit to the SQL produces a fresh name.

use sha2::{Digest, Sha256};

use crate::clauses::Cte;
use crate::dag::{Model, ModelBacking};
use crate::dialect::Dialect;

/// Lower-hex sha256 digest of `input`, truncated to `len` characters.
pub fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(len);
    hex
}

/// Stable sub-query name for a model: `<name>_<8 hex of its SQL>`.
pub fn model_query_name(model: &Model) -> String {
    format!("{}_{}", model.name, short_hash(&model.sql, 8))
}

/// Cache-file name for a compiled insight's result set.
pub fn insight_file(insight_name: &str, rendered: &str) -> String {
    format!(
        "{}.parquet",
        short_hash(&format!("{insight_name}{rendered}"), 16)
    )
}

/// Content-hashed select-list alias. Identical expressions collapse to one
/// select item because they hash to the same alias.
pub fn column_alias(expr: &str) -> String {
    format!("c_{}", short_hash(expr, 8))
}

/// Model SQL with any trailing statement terminator removed, so it embeds
/// as a derived table or CTE body.
pub fn trimmed_sql(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

/// Server-side CTE body: the model's SQL with its dimensions projected
/// alongside every base column.
fn server_body(model: &Model, dialect: Dialect) -> String {
    let base = trimmed_sql(&model.sql);
    if model.dimensions.is_empty() {
        return base.to_string();
    }
    let dims: Vec<String> = model
        .dimensions
        .iter()
        .map(|d| {
            format!(
                "{} AS {}",
                d.expression,
                dialect.normalize_identifier(&d.name)
            )
        })
        .collect();
    format!("SELECT base.*, {} FROM ({base}) AS base", dims.join(", "))
}

/// Client-side CTE body: the model's cached artifact, or the file it is
/// backed by.
fn client_body(model: &Model) -> String {
    match &model.backing {
        ModelBacking::File { path } => format!("SELECT * FROM '{path}'"),
        ModelBacking::Sql { .. } => {
            format!("SELECT * FROM '{}.parquet'", model_query_name(model))
        }
    }
}

/// The CTE heading a compiled statement for one referenced model.
pub fn cte(model: &Model, dialect: Dialect, dynamic: bool) -> Cte {
    let body = if dynamic {
        client_body(model)
    } else {
        match &model.backing {
            ModelBacking::File { path } => format!("SELECT * FROM '{path}'"),
            ModelBacking::Sql { .. } => server_body(model, dialect),
        }
    };
    Cte {
        name: model_query_name(model),
        body,
    }
}

/// FROM entry: the hashed sub-query aliased back to the model's own name,
/// so qualified column references read naturally.
pub fn from_entry(model: &Model, dialect: Dialect) -> String {
    format!(
        "{} AS {}",
        dialect.normalize_identifier(&model_query_name(model)),
        dialect.normalize_identifier(&model.name)
    )
}
