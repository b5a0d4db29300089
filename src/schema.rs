//! Schema extraction and the process-wide schema cache.
//!
//! Column sets are probed lazily from a live backend, memoized per
//! `(source, model)` for the duration of a run, and never invalidated
//! mid-run. Extraction failure degrades to an empty schema: callers treat
//! an empty schema as "cannot qualify or star-expand this model" and keep
//! compiling rather than aborting the run.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dag::Model;
use crate::error::Result;

/// Rows returned by a backend, column-major metadata plus row-major cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResult {
    pub columns: Vec<String>,
    /// Native type names as reported by the backend driver, when available.
    pub native_types: Vec<Option<String>>,
    pub rows: Vec<Vec<Value>>,
}

impl SqlResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A live backend connection, owned by the surrounding job layer.
pub trait Backend: Send + Sync {
    fn read_sql(&self, query: &str) -> Result<SqlResult>;
    fn dialect(&self) -> &str;
}

/// Named backend connections for one run.
#[derive(Default)]
pub struct Backends {
    connections: HashMap<String, Box<dyn Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, backend: Box<dyn Backend>) {
        self.connections.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Backend> {
        self.connections.get(name).map(|b| b.as_ref())
    }
}

/// Column type as the compiler understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Timestamp,
    Date,
    Time,
    Decimal,
    Integer,
    Float,
    Text,
    Bytes,
    Unknown,
}

/// Column name -> type for one model.
pub type ColumnSchema = BTreeMap<String, ColumnType>;

/// Process-wide, concurrency-safe schema cache.
///
/// Created once per run and discarded at run end. Concurrent first-use races
/// on one key are safe to lose: recomputation yields an identical value, and
/// the concurrent map keeps the structure itself consistent.
#[derive(Default)]
pub struct SchemaCache {
    entries: DashMap<(String, String), Arc<ColumnSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The column schema for `model` on `source`, probing on first use.
    pub fn schema_for(&self, backend: &dyn Backend, source: &str, model: &Model) -> Arc<ColumnSchema> {
        let key = (source.to_string(), model.name.clone());
        if let Some(entry) = self.entries.get(&key) {
            return entry.clone();
        }
        let schema = match extract_schema(backend, model) {
            Ok(schema) => Arc::new(schema),
            Err(err) => {
                warn!(
                    source,
                    model = %model.name,
                    error = %err,
                    "schema probe failed, degrading to empty schema"
                );
                Arc::new(ColumnSchema::new())
            }
        };
        self.entries.insert(key, schema.clone());
        schema
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Wrap a model body as a derived-table source, tolerating a trailing `;`.
fn derived_table(model: &Model) -> String {
    model.sql.trim().trim_end_matches(';').to_string()
}

fn extract_schema(backend: &dyn Backend, model: &Model) -> Result<ColumnSchema> {
    let body = derived_table(model);

    // Zero-row probe: the driver's column/type metadata is enough when the
    // backend reports native types.
    let probe = backend.read_sql(&format!("SELECT * FROM ({body}) AS probe WHERE 1 = 0"))?;
    if !probe.columns.is_empty() && probe.native_types.iter().any(|t| t.is_some()) {
        let mut schema = ColumnSchema::new();
        for (column, native) in probe.columns.iter().zip(&probe.native_types) {
            let column_type = match native {
                Some(name) => type_from_native_name(name),
                None => type_from_column_name(column),
            };
            schema.insert(column.clone(), column_type);
        }
        debug!(model = %model.name, columns = schema.len(), "schema from native types");
        return Ok(schema);
    }

    // No type metadata: sample a few rows and infer from observed values.
    let sample = backend.read_sql(&format!("SELECT * FROM ({body}) AS probe LIMIT 50"))?;
    let mut schema = ColumnSchema::new();
    for (index, column) in sample.columns.iter().enumerate() {
        let observed = sample
            .rows
            .iter()
            .filter_map(|row| row.get(index))
            .find(|value| !value.is_null());
        let column_type = match observed {
            Some(value) => type_from_value(value),
            None => type_from_column_name(column),
        };
        schema.insert(column.clone(), column_type);
    }
    debug!(model = %model.name, columns = schema.len(), "schema inferred from sample");
    Ok(schema)
}

/// Map a backend's native type name onto a compiler type.
fn type_from_native_name(name: &str) -> ColumnType {
    let upper = name.to_uppercase();
    if upper.contains("BOOL") {
        ColumnType::Boolean
    } else if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        ColumnType::Timestamp
    } else if upper.contains("DATE") {
        ColumnType::Date
    } else if upper.contains("TIME") {
        ColumnType::Time
    } else if upper.contains("DECIMAL") || upper.contains("NUMERIC") {
        ColumnType::Decimal
    } else if upper.contains("INT") {
        ColumnType::Integer
    } else if upper.contains("FLOAT") || upper.contains("DOUBLE") || upper.contains("REAL") {
        ColumnType::Float
    } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("STRING") {
        ColumnType::Text
    } else if upper.contains("BINARY") || upper.contains("BLOB") || upper.contains("BYTE") {
        ColumnType::Bytes
    } else {
        ColumnType::Unknown
    }
}

/// Infer a type from one observed native value.
///
/// Boolean is checked before integer: integers are a superset of booleans in
/// several runtimes, so the narrower check must win.
fn type_from_value(value: &Value) -> ColumnType {
    match value {
        Value::Bool(_) => ColumnType::Boolean,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                ColumnType::Integer
            } else {
                ColumnType::Float
            }
        }
        Value::String(s) => type_from_text(s),
        Value::Null => ColumnType::Unknown,
        Value::Array(_) | Value::Object(_) => ColumnType::Unknown,
    }
}

/// Ordered parse attempts for stringly-typed values:
/// boolean -> timestamp -> date -> time -> decimal -> integer -> float ->
/// string. Decimal requires a fractional part so plain integers stay
/// integers.
fn type_from_text(text: &str) -> ColumnType {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
        return ColumnType::Boolean;
    }
    if DateTime::parse_from_rfc3339(trimmed).is_ok()
        || NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f").is_ok()
    {
        return ColumnType::Timestamp;
    }
    if NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok() {
        return ColumnType::Date;
    }
    if NaiveTime::parse_from_str(trimmed, "%H:%M:%S").is_ok()
        || NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f").is_ok()
    {
        return ColumnType::Time;
    }
    if trimmed.contains('.') && Decimal::from_str(trimmed).is_ok() {
        return ColumnType::Decimal;
    }
    if trimmed.parse::<i64>().is_ok() {
        return ColumnType::Integer;
    }
    if trimmed.parse::<f64>().is_ok() {
        return ColumnType::Float;
    }
    ColumnType::Text
}

/// Last resort: guess from the column name alone.
fn type_from_column_name(name: &str) -> ColumnType {
    let lower = name.to_lowercase();
    if lower.starts_with("is_") || lower.starts_with("has_") {
        ColumnType::Boolean
    } else if lower.ends_with("_at") || lower.contains("timestamp") {
        ColumnType::Timestamp
    } else if lower.contains("date") {
        ColumnType::Date
    } else if lower.ends_with("_id") || lower == "id" || lower.ends_with("_count") {
        ColumnType::Integer
    } else {
        ColumnType::Text
    }
}
