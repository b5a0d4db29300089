//! Project entity model and the dependency graph the compiler resolves
//! references against.
//!
//! Entities are produced by the configuration layer (out of scope here) and
//! are immutable for the lifetime of a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strsim::levenshtein;

use crate::error::{Error, Result};

/// How a model obtains its backing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelBacking {
    /// A SQL body executed against a named backend connection.
    Sql { source: String },
    /// A local file the client engine scans directly (csv or parquet).
    File { path: String },
}

impl ModelBacking {
    /// The backend connection name this backing resolves to, if any.
    pub fn resolve_source(&self) -> Option<&str> {
        match self {
            Self::Sql { source } => Some(source),
            Self::File { .. } => None,
        }
    }
}

/// A derived column defined on a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub expression: String,
}

/// A reusable aggregate expression macro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub expression: String,
}

/// A named dataset backed by a SQL text body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub sql: String,
    pub backing: ModelBacking,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
}

impl Model {
    pub fn sql(name: impl Into<String>, source: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            backing: ModelBacking::Sql {
                source: source.into(),
            },
            dimensions: Vec::new(),
        }
    }

    pub fn with_dimension(
        mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            expression: expression.into(),
        });
        self
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }
}

/// Whether an input holds one value or a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    SingleChoice,
    MultiChoice,
}

/// Where an input's options come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputOptions {
    Static(Vec<String>),
    /// Options produced by a one-column query against `model`.
    Query { model: String, sql: String },
}

/// A runtime-controlled value, unknown at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    pub kind: InputKind,
    pub options: InputOptions,
    #[serde(default)]
    pub default: Option<String>,
}

/// Accessors an input exposes inside reference tokens.
pub const INPUT_ACCESSORS: &[&str] = &["value", "values", "min", "max", "first", "last"];

impl Input {
    pub fn single(name: impl Into<String>, options: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::SingleChoice,
            options: InputOptions::Static(options.into_iter().map(String::from).collect()),
            default: None,
        }
    }

    pub fn multi(name: impl Into<String>, options: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::MultiChoice,
            options: InputOptions::Static(options.into_iter().map(String::from).collect()),
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// A representative SQL literal for this input, used by the codec so the
    /// deferred placeholder parses. Statically-known options only; query
    /// options are resolved by the compiler through the backend.
    pub fn sample_literal(&self) -> Option<String> {
        let raw = match &self.options {
            InputOptions::Static(options) => options.first().or(self.default.as_ref())?,
            InputOptions::Query { .. } => self.default.as_ref()?,
        };
        Some(render_literal(raw))
    }
}

/// Render an option value as a SQL literal: numbers stay bare, everything
/// else is single-quoted.
pub fn render_literal(raw: &str) -> String {
    if raw.parse::<f64>().is_ok() {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', "''"))
    }
}

/// A client interaction on an insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Interaction {
    Filter(String),
    Split(String),
    Sort(String),
}

/// A declarative chart spec: props plus interactions, compiled to SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub name: String,
    pub chart_type: String,
    /// The backing model; always the first FROM relation.
    pub model: String,
    /// Visual-property tree; leaves may be expression strings.
    pub props: serde_json::Value,
    /// Extra computed fields, name -> expression.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

impl Insight {
    pub fn new(
        name: impl Into<String>,
        chart_type: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            chart_type: chart_type.into(),
            model: model.into(),
            props: serde_json::Value::Object(serde_json::Map::new()),
            columns: BTreeMap::new(),
            interactions: Vec::new(),
        }
    }

    /// Set a prop leaf at a dotted path, creating intermediate objects. A
    /// segment landing on an existing leaf replaces it, so the last write
    /// wins like plain object assignment.
    pub fn with_prop(mut self, path: &str, value: impl Into<String>) -> Self {
        let mut node = &mut self.props;
        let parts: Vec<&str> = path.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            if !node.is_object() {
                *node = serde_json::Value::Object(serde_json::Map::new());
            }
            let serde_json::Value::Object(map) = node else {
                unreachable!("normalized to an object above")
            };
            if i == parts.len() - 1 {
                map.insert(
                    part.to_string(),
                    serde_json::Value::String(value.into()),
                );
                break;
            }
            node = map
                .entry(part.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        }
        self
    }

    pub fn with_column(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.columns.insert(name.into(), expression.into());
        self
    }

    pub fn with_interaction(mut self, interaction: Interaction) -> Self {
        self.interactions.push(interaction);
        self
    }
}

/// Any named entity a reference token can resolve to.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Model(Model),
    Input(Input),
    Metric(Metric),
    Dimension(Dimension),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Self::Model(m) => &m.name,
            Self::Input(i) => &i.name,
            Self::Metric(m) => &m.name,
            Self::Dimension(d) => &d.name,
        }
    }
}

/// Name -> entity lookup for one project.
///
/// Built once per run by the configuration layer; the compiler only reads.
#[derive(Debug, Default, Clone)]
pub struct ProjectDag {
    entities: BTreeMap<String, Entity>,
}

impl ProjectDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.name().to_string(), entity);
    }

    pub fn with(mut self, entity: Entity) -> Self {
        self.insert(entity);
        self
    }

    /// Look an entity up by name, suggesting the closest known name on miss.
    pub fn get_by_name(&self, name: &str) -> Result<&Entity> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::ReferenceNotFound {
                name: name.to_string(),
                suggestion: self.closest_name(name),
            })
    }

    pub fn get_model(&self, name: &str) -> Result<&Model> {
        match self.get_by_name(name)? {
            Entity::Model(m) => Ok(m),
            other => Err(Error::ReferenceNotFound {
                name: format!("{} (found a non-model entity '{}')", name, other.name()),
                suggestion: None,
            }),
        }
    }

    pub fn get_input(&self, name: &str) -> Option<&Input> {
        match self.entities.get(name) {
            Some(Entity::Input(i)) => Some(i),
            _ => None,
        }
    }

    fn closest_name(&self, name: &str) -> Option<String> {
        self.entities
            .keys()
            .map(|candidate| (levenshtein(name, candidate), candidate))
            .filter(|(distance, _)| *distance <= 2)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, candidate)| candidate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_hit() {
        let dag = ProjectDag::new().with(Entity::Model(Model::sql(
            "orders",
            "warehouse",
            "SELECT * FROM raw.orders",
        )));
        assert!(matches!(
            dag.get_by_name("orders"),
            Ok(Entity::Model(m)) if m.name == "orders"
        ));
    }

    #[test]
    fn test_lookup_miss_suggests_closest() {
        let dag = ProjectDag::new().with(Entity::Model(Model::sql(
            "orders",
            "warehouse",
            "SELECT 1",
        )));
        let err = dag.get_by_name("order").unwrap_err();
        assert_eq!(
            err,
            Error::ReferenceNotFound {
                name: "order".to_string(),
                suggestion: Some("orders".to_string()),
            }
        );
    }

    #[test]
    fn test_lookup_miss_far_name_has_no_suggestion() {
        let dag = ProjectDag::new().with(Entity::Model(Model::sql(
            "orders",
            "warehouse",
            "SELECT 1",
        )));
        let err = dag.get_by_name("customers").unwrap_err();
        assert!(matches!(
            err,
            Error::ReferenceNotFound {
                suggestion: None,
                ..
            }
        ));
    }

    #[test]
    fn test_sample_literal_prefers_first_static_option() {
        let input = Input::single("threshold", vec!["100", "500"]);
        assert_eq!(input.sample_literal(), Some("100".to_string()));

        let input = Input::single("region", vec!["east", "west"]);
        assert_eq!(input.sample_literal(), Some("'east'".to_string()));
    }

    #[test]
    fn test_sample_literal_falls_back_to_default_for_query_options() {
        let input = Input {
            name: "pick".to_string(),
            kind: InputKind::SingleChoice,
            options: InputOptions::Query {
                model: "orders".to_string(),
                sql: "SELECT DISTINCT region FROM ${ref(orders)}".to_string(),
            },
            default: Some("east".to_string()),
        };
        assert_eq!(input.sample_literal(), Some("'east'".to_string()));

        let no_default = Input {
            default: None,
            ..input
        };
        assert_eq!(no_default.sample_literal(), None);
    }

    #[test]
    fn test_prop_builder_creates_nested_tree() {
        let insight = Insight::new("sales", "scatter", "orders")
            .with_prop("x", "${ref(orders).date}")
            .with_prop("marker.color", "'blue'");
        assert_eq!(
            insight.props["marker"]["color"],
            serde_json::json!("'blue'")
        );
    }

    #[test]
    fn test_prop_builder_replaces_a_leaf_on_path_collision() {
        let insight = Insight::new("sales", "scatter", "orders")
            .with_prop("marker", "'blue'")
            .with_prop("marker.size", "12");
        assert_eq!(
            insight.props,
            serde_json::json!({ "marker": { "size": "12" } })
        );
    }

    #[test]
    fn test_literal_rendering_escapes_quotes() {
        assert_eq!(render_literal("3.5"), "3.5");
        assert_eq!(render_literal("o'brien"), "'o''brien'");
    }
}
