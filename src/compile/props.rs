//! Prop-tree traversal: leaf collection for compilation and the pruned
//! static-prop tree that ships to the client alongside the queries.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::dag::ProjectDag;
use crate::error::Result;
use crate::refs::rewriter;

/// One expression-bearing leaf with its dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub path: String,
    pub expression: String,
}

/// Every string leaf under `props`, depth-first, paths prefixed `props.`.
/// Array elements address as `path[i]`.
pub fn collect_leaves(props: &Value) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    walk(props, "props", &mut leaves);
    leaves
}

fn walk(node: &Value, path: &str, out: &mut Vec<Leaf>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                walk(value, &format!("{path}.{key}"), out);
            }
        }
        Value::Array(items) => {
            for (i, value) in items.iter().enumerate() {
                walk(value, &format!("{path}[{i}]"), out);
            }
        }
        Value::String(expression) => out.push(Leaf {
            path: path.to_string(),
            expression: expression.clone(),
        }),
        _ => {}
    }
}

/// The prop tree minus query-expression leaves. Input references in the
/// remaining leaves are normalized to deferred `${name[.accessor]}` form.
/// Array elements are nulled rather than removed so sibling paths keep
/// their indices.
pub fn static_props(
    props: &Value,
    query_paths: &BTreeSet<String>,
    dag: &ProjectDag,
) -> Result<Value> {
    Ok(prune(props, "props", query_paths, dag)?.unwrap_or(Value::Object(Map::new())))
}

fn prune(
    node: &Value,
    path: &str,
    query_paths: &BTreeSet<String>,
    dag: &ProjectDag,
) -> Result<Option<Value>> {
    match node {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if let Some(kept) = prune(value, &format!("{path}.{key}"), query_paths, dag)? {
                    out.insert(key.clone(), kept);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, value) in items.iter().enumerate() {
                out.push(
                    prune(value, &format!("{path}[{i}]"), query_paths, dag)?
                        .unwrap_or(Value::Null),
                );
            }
            Ok(Some(Value::Array(out)))
        }
        Value::String(expression) => {
            if query_paths.contains(path) {
                return Ok(None);
            }
            let rewritten = rewriter::rewrite(expression, dag)?;
            Ok(Some(Value::String(rewritten.text)))
        }
        other => Ok(Some(other.clone())),
    }
}
