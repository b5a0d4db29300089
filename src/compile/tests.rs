use std::sync::Mutex;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::dag::{Entity, Input, InputKind, InputOptions, Insight, Interaction, Model};
use crate::error::Error;
use crate::schema::{Backend, Backends, SchemaCache, SqlResult};

/// Canned backend: one fixed result for every query, queries recorded.
struct FakeBackend {
    dialect: String,
    result: SqlResult,
    queries: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn new(dialect: &str, result: SqlResult) -> Self {
        Self {
            dialect: dialect.to_string(),
            result,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn probe(dialect: &str) -> Self {
        Self::new(
            dialect,
            SqlResult {
                columns: vec![
                    "date".to_string(),
                    "amount".to_string(),
                    "region".to_string(),
                ],
                native_types: vec![
                    Some("DATE".to_string()),
                    Some("DECIMAL(12,2)".to_string()),
                    Some("VARCHAR".to_string()),
                ],
                rows: Vec::new(),
            },
        )
    }
}

impl Backend for FakeBackend {
    fn read_sql(&self, sql: &str) -> crate::error::Result<SqlResult> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.result.clone())
    }

    fn dialect(&self) -> &str {
        &self.dialect
    }
}

fn orders_model() -> Model {
    Model::sql("orders", "warehouse", "SELECT * FROM raw.orders")
}

fn project() -> ProjectDag {
    ProjectDag::new()
        .with(Entity::Model(orders_model()))
        .with(Entity::Input(Input::single("threshold", vec!["100", "500"])))
}

fn compile(
    dag: &ProjectDag,
    backend: &FakeBackend,
    insight: &Insight,
) -> CompileResult<QueryInfo> {
    let mut backends = Backends::new();
    backends.insert(
        "warehouse",
        Box::new(FakeBackend::new(&backend.dialect, backend.result.clone())),
    );
    let schemas = SchemaCache::new();
    Compiler::new(dag, &backends, &schemas).compile(insight)
}

#[test]
fn test_static_insight_compiles_to_pre_and_post_query() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("y", "SUM(${ref(orders).amount})");
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    assert!(!info.is_dynamic());
    let pre = info.pre_query.as_deref().unwrap();
    let cte = model_query_name(&orders_model());
    let x_alias = column_alias("\"orders\".\"date\"");
    let y_alias = column_alias("SUM(\"orders\".\"amount\")");
    assert_eq!(
        pre,
        format!(
            "WITH \"{cte}\" AS (SELECT * FROM raw.orders) \
             SELECT \"orders\".\"date\" AS \"{x_alias}\", \
             SUM(\"orders\".\"amount\") AS \"{y_alias}\" \
             FROM \"{cte}\" AS \"orders\" \
             GROUP BY \"{x_alias}\""
        )
    );
    assert_eq!(
        info.post_query,
        format!("SELECT * FROM '{}'", insight_file("sales", pre))
    );
    assert_eq!(info.props_mapping["props.x"], x_alias);
    assert_eq!(info.props_mapping["props.y"], y_alias);
    assert_eq!(info.split_key, None);
}

#[test]
fn test_input_reference_makes_the_insight_dynamic() {
    let dag = project();
    let insight = Insight::new("sales", "scatter", "orders").with_prop(
        "marker.color",
        "CASE WHEN SUM(${ref(orders).amount}) > ${ref(threshold).value} \
         THEN 'red' ELSE 'blue' END",
    );
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    assert!(info.is_dynamic());
    assert_eq!(info.pre_query, None);
    // Deferred tokens survive the round trip through the sample literals.
    assert!(info.post_query.contains("${threshold.value}"));
    assert!(info.post_query.contains("${ref(orders).amount}"));
    assert!(!info.post_query.contains("__INPUT"));
    // The client reads the model's cached artifact, not the backend.
    let cte = model_query_name(&orders_model());
    assert!(
        info.post_query
            .contains(&format!("\"{cte}\" AS (SELECT * FROM '{cte}.parquet')"))
    );
}

#[test]
fn test_filters_split_between_where_and_having() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("y", "SUM(${ref(orders).amount})")
        .with_interaction(Interaction::Filter("${ref(orders).region} = 'east'".into()))
        .with_interaction(Interaction::Filter("SUM(${ref(orders).amount}) > 100".into()));
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    let pre = info.pre_query.unwrap();
    assert!(pre.contains("WHERE \"orders\".\"region\" = 'east'"));
    assert!(pre.contains("HAVING SUM(\"orders\".\"amount\") > 100"));
    let where_at = pre.find("WHERE").unwrap();
    let group_at = pre.find("GROUP BY").unwrap();
    let having_at = pre.find("HAVING").unwrap();
    assert!(where_at < group_at && group_at < having_at);
}

#[test]
fn test_aggregate_filter_with_input_lands_in_having() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_interaction(Interaction::Filter(
            "SUM(${ref(orders).amount}) > ${ref(threshold).value}".into(),
        ));
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    assert!(info.is_dynamic());
    assert!(
        info.post_query
            .contains("HAVING SUM(${ref(orders).amount}) > ${threshold.value}")
    );
    assert!(!info.post_query.contains("WHERE"));
}

#[test]
fn test_sort_on_raw_column_rewrites_to_grouped_alias() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("y", "SUM(${ref(orders).amount})")
        .with_interaction(Interaction::Sort("${ref(orders).date} DESC".into()));
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    let x_alias = column_alias("\"orders\".\"date\"");
    assert!(
        info.pre_query
            .unwrap()
            .ends_with(&format!("ORDER BY \"{x_alias}\" DESC"))
    );
}

#[test]
fn test_split_column_joins_select_list_and_group_by() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("y", "SUM(${ref(orders).amount})")
        .with_interaction(Interaction::Split("${ref(orders).region}".into()));
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    let split_alias = column_alias("\"orders\".\"region\"");
    assert_eq!(info.split_key.as_deref(), Some(split_alias.as_str()));
    let pre = info.pre_query.unwrap();
    assert!(pre.contains(&format!("\"orders\".\"region\" AS \"{split_alias}\"")));
    assert!(pre.contains(&format!("GROUP BY \"{split_alias}\"")));
}

#[test]
fn test_literal_split_never_joins_group_by() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("y", "SUM(${ref(orders).amount})")
        .with_interaction(Interaction::Split("'all'".into()));
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    let x_alias = column_alias("\"orders\".\"date\"");
    let pre = info.pre_query.unwrap();
    assert!(pre.contains(&format!("GROUP BY \"{x_alias}\"")));
    assert!(!pre.contains(&format!("GROUP BY \"{x_alias}\", ")));
}

#[test]
fn test_identical_expressions_share_one_select_item() {
    let dag = project();
    let insight = Insight::new("sales", "line", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("hover", "${ref(orders).date}");
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    let alias = column_alias("\"orders\".\"date\"");
    assert_eq!(info.props_mapping["props.x"], alias);
    assert_eq!(info.props_mapping["props.hover"], alias);
    let pre = info.pre_query.unwrap();
    assert_eq!(pre.matches(&format!("\"{alias}\"")).count(), 1);
}

#[test]
fn test_static_props_keep_plain_leaves_and_defer_inputs() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("marker.size", "12")
        .with_prop("tooltip", "threshold is ${ref(threshold).value}");
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    // An Input anywhere in the tree defers the compile, even when the
    // query expressions themselves reference none.
    assert!(info.is_dynamic());
    assert!(info.post_query.contains("${ref(orders).date}"));
    assert_eq!(
        info.static_props,
        json!({
            "marker": { "size": "12" },
            "tooltip": "threshold is ${threshold.value}",
        })
    );
    assert!(info.props_mapping.contains_key("props.x"));
    assert!(!info.props_mapping.contains_key("props.tooltip"));
}

#[test]
fn test_columns_compile_like_props() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_column("total", "SUM(${ref(orders).amount})");
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    assert_eq!(
        info.props_mapping["columns.total"],
        column_alias("SUM(\"orders\".\"amount\")")
    );
}

#[test]
fn test_schema_validation_rejects_unknown_columns() {
    let dag = project();
    let insight =
        Insight::new("sales", "bar", "orders").with_prop("x", "${ref(orders).amont}");
    let err = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap_err();

    assert_eq!(err.insight, "sales");
    assert_eq!(err.path, "props.x");
    assert_eq!(
        err.source,
        Error::ReferenceNotFound {
            name: "orders.amont".to_string(),
            suggestion: Some("orders.amount".to_string()),
        }
    );
}

#[test]
fn test_unknown_reference_is_wrapped_with_path() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders").with_prop("x", "${ref(order).date}");
    let err = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap_err();

    assert_eq!(err.path, "props.x");
    assert_eq!(err.expression, "${ref(order).date}");
    assert!(matches!(err.source, Error::ReferenceNotFound { .. }));
}

#[test]
fn test_window_function_filter_is_rejected() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_interaction(Interaction::Filter(
            "ROW_NUMBER() OVER (ORDER BY ${ref(orders).date}) = 1".into(),
        ));
    let err = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap_err();

    assert_eq!(err.path, "interactions[0]");
    assert!(matches!(err.source, Error::Parse { .. }));
}

#[test]
fn test_query_derived_options_resolve_through_the_backend() {
    let backend = FakeBackend::new(
        "duckdb",
        SqlResult {
            columns: vec!["region".to_string()],
            native_types: vec![Some("VARCHAR".to_string())],
            rows: vec![vec![json!("east")], vec![json!("west")]],
        },
    );
    let dag = ProjectDag::new()
        .with(Entity::Model(orders_model()))
        .with(Entity::Input(Input {
            name: "pick".to_string(),
            kind: InputKind::SingleChoice,
            options: InputOptions::Query {
                model: "orders".to_string(),
                sql: "SELECT DISTINCT region FROM ${ref(orders)}".to_string(),
            },
            default: None,
        }));
    let insight = Insight::new("sales", "bar", "orders").with_interaction(Interaction::Filter(
        "${ref(orders).region} = ${ref(pick).value}".into(),
    ));

    let mut backends = Backends::new();
    backends.insert("warehouse", Box::new(backend));
    let schemas = SchemaCache::new();
    let info = Compiler::new(&dag, &backends, &schemas)
        .compile(&insight)
        .unwrap();

    // Dynamic, with the option query's first value as the sample behind
    // the deferred placeholder.
    assert!(info.is_dynamic());
    assert!(info.post_query.contains("${pick.value}"));
}

#[test]
fn test_empty_option_query_fails_the_compile() {
    let backend = FakeBackend::new(
        "duckdb",
        SqlResult {
            columns: vec!["region".to_string()],
            native_types: vec![Some("VARCHAR".to_string())],
            rows: Vec::new(),
        },
    );
    let dag = ProjectDag::new()
        .with(Entity::Model(orders_model()))
        .with(Entity::Input(Input {
            name: "pick".to_string(),
            kind: InputKind::SingleChoice,
            options: InputOptions::Query {
                model: "orders".to_string(),
                sql: "SELECT DISTINCT region FROM ${ref(orders)}".to_string(),
            },
            default: None,
        }));
    let insight = Insight::new("sales", "bar", "orders").with_interaction(Interaction::Filter(
        "${ref(orders).region} = ${ref(pick).value}".into(),
    ));

    let mut backends = Backends::new();
    backends.insert("warehouse", Box::new(backend));
    let schemas = SchemaCache::new();
    let err = Compiler::new(&dag, &backends, &schemas)
        .compile(&insight)
        .unwrap_err();

    assert_eq!(err.path, "inputs.pick");
    assert!(matches!(err.source, Error::InputQuery { .. }));
}

#[test]
fn test_option_query_spanning_two_models_is_rejected() {
    let dag = ProjectDag::new()
        .with(Entity::Model(orders_model()))
        .with(Entity::Model(Model::sql(
            "regions",
            "warehouse",
            "SELECT * FROM raw.regions",
        )))
        .with(Entity::Input(Input {
            name: "pick".to_string(),
            kind: InputKind::SingleChoice,
            options: InputOptions::Query {
                model: "orders".to_string(),
                sql: "SELECT r.name FROM ${ref(orders)} o JOIN ${ref(regions)} r ON o.region = r.code"
                    .to_string(),
            },
            default: None,
        }));
    let insight = Insight::new("sales", "bar", "orders").with_interaction(Interaction::Filter(
        "${ref(orders).region} = ${ref(pick).value}".into(),
    ));

    let err = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap_err();

    assert_eq!(err.path, "inputs.pick");
    assert!(matches!(err.source, Error::ReferenceArity { found: 2, .. }));
}

#[test]
fn test_query_info_serializes_round_trip() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders")
        .with_prop("x", "${ref(orders).date}")
        .with_prop("y", "SUM(${ref(orders).amount})");
    let info = compile(&dag, &FakeBackend::probe("duckdb"), &insight).unwrap();

    let encoded = serde_json::to_string(&info).unwrap();
    let decoded: QueryInfo = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, info);
}

#[test]
fn test_snowflake_backend_uppercases_identifiers() {
    let dag = project();
    let insight = Insight::new("sales", "bar", "orders").with_prop("x", "${ref(orders).date}");
    let info = compile(&dag, &FakeBackend::probe("snowflake"), &insight).unwrap();

    let pre = info.pre_query.unwrap();
    assert!(pre.contains("\"ORDERS\".\"DATE\""));
    assert!(pre.contains("AS \"ORDERS\""));
}
