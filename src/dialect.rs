//! SQL dialect handling: identifier normalization and parser selection.
//!
//! Each backend speaks one dialect. A dialect controls how identifiers are
//! case-folded and quoted, which parser variant reads its SQL, and which
//! function names count as aggregates when the parser cannot tell.

use sqlparser::dialect::{
    BigQueryDialect, Dialect as ParserDialect, DuckDbDialect, GenericDialect, MySqlDialect,
    PostgreSqlDialect, RedshiftSqlDialect, SQLiteDialect, SnowflakeDialect,
};
use tracing::warn;

/// A backend's SQL variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Snowflake,
    Postgres,
    Redshift,
    Mysql,
    Bigquery,
    Duckdb,
    Sqlite,
    Generic,
}

/// The fixed dialect of the browser-side engine that runs post-queries.
pub const CLIENT_DIALECT: Dialect = Dialect::Duckdb;

/// How a dialect folds identifier case before quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseFold {
    Upper,
    Lower,
    Preserve,
}

impl Dialect {
    /// Resolve a backend's `dialect()` string. Unknown names fall back to
    /// `Generic` with a warning rather than failing the run.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "snowflake" => Self::Snowflake,
            "postgres" | "postgresql" | "pg" => Self::Postgres,
            "redshift" => Self::Redshift,
            "mysql" | "mariadb" => Self::Mysql,
            "bigquery" => Self::Bigquery,
            "duckdb" => Self::Duckdb,
            "sqlite" => Self::Sqlite,
            "generic" => Self::Generic,
            other => {
                warn!(dialect = other, "unknown dialect, using generic quoting");
                Self::Generic
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Snowflake => "snowflake",
            Self::Postgres => "postgres",
            Self::Redshift => "redshift",
            Self::Mysql => "mysql",
            Self::Bigquery => "bigquery",
            Self::Duckdb => "duckdb",
            Self::Sqlite => "sqlite",
            Self::Generic => "generic",
        }
    }

    /// The sqlparser dialect that reads this backend's SQL.
    pub fn parser(&self) -> Box<dyn ParserDialect> {
        match self {
            Self::Snowflake => Box::new(SnowflakeDialect {}),
            Self::Postgres => Box::new(PostgreSqlDialect {}),
            Self::Redshift => Box::new(RedshiftSqlDialect {}),
            Self::Mysql => Box::new(MySqlDialect {}),
            Self::Bigquery => Box::new(BigQueryDialect {}),
            Self::Duckdb => Box::new(DuckDbDialect {}),
            Self::Sqlite => Box::new(SQLiteDialect {}),
            Self::Generic => Box::new(GenericDialect {}),
        }
    }

    fn case_fold(&self) -> CaseFold {
        match self {
            Self::Snowflake => CaseFold::Upper,
            Self::Postgres | Self::Redshift => CaseFold::Lower,
            _ => CaseFold::Preserve,
        }
    }

    fn quote_char(&self) -> char {
        match self {
            Self::Mysql | Self::Bigquery => '`',
            _ => '"',
        }
    }

    /// Render a logical name as this dialect's quoted identifier.
    ///
    /// The same logical name always renders to the same quoted string, so a
    /// SELECT alias and its GROUP BY / ORDER BY uses agree byte-for-byte.
    pub fn normalize_identifier(&self, name: &str) -> String {
        let folded = match self.case_fold() {
            CaseFold::Upper => name.to_uppercase(),
            CaseFold::Lower => name.to_lowercase(),
            CaseFold::Preserve => name.to_string(),
        };
        let q = self.quote_char();
        let escaped = folded.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Render a dotted path (`relation.column`) with each part normalized.
    pub fn normalize_path(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .map(|p| self.normalize_identifier(p))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Function names classified as aggregates in this dialect.
    ///
    /// sqlparser does not tag aggregate calls, so this table is the
    /// authority; it also covers names the parser would mis-tag.
    pub fn aggregate_functions(&self) -> &'static [&'static str] {
        const COMMON: &[&str] = &[
            "avg",
            "count",
            "max",
            "min",
            "sum",
            "stddev",
            "stddev_pop",
            "stddev_samp",
            "var_pop",
            "var_samp",
            "variance",
            "corr",
            "covar_pop",
            "covar_samp",
            "median",
            "mode",
            "percentile_cont",
            "percentile_disc",
            "array_agg",
            "string_agg",
            "bool_and",
            "bool_or",
            "any_value",
            "approx_count_distinct",
        ];
        const MYSQL: &[&str] = &[
            "avg",
            "count",
            "max",
            "min",
            "sum",
            "std",
            "stddev",
            "stddev_pop",
            "stddev_samp",
            "var_pop",
            "var_samp",
            "variance",
            "group_concat",
            "json_arrayagg",
            "json_objectagg",
            "bit_and",
            "bit_or",
            "bit_xor",
            "any_value",
        ];
        const SNOWFLAKE: &[&str] = &[
            "avg",
            "count",
            "count_if",
            "max",
            "min",
            "sum",
            "stddev",
            "stddev_pop",
            "stddev_samp",
            "var_pop",
            "var_samp",
            "variance",
            "median",
            "mode",
            "listagg",
            "array_agg",
            "object_agg",
            "any_value",
            "approx_count_distinct",
            "percentile_cont",
            "percentile_disc",
            "corr",
        ];
        const DUCKDB: &[&str] = &[
            "avg",
            "count",
            "count_if",
            "max",
            "min",
            "sum",
            "stddev",
            "stddev_pop",
            "stddev_samp",
            "var_pop",
            "var_samp",
            "variance",
            "median",
            "mode",
            "list",
            "array_agg",
            "string_agg",
            "bool_and",
            "bool_or",
            "bit_and",
            "bit_or",
            "arg_max",
            "arg_min",
            "any_value",
            "approx_count_distinct",
            "quantile_cont",
            "quantile_disc",
            "corr",
        ];
        match self {
            Self::Mysql => MYSQL,
            Self::Snowflake => SNOWFLAKE,
            Self::Duckdb => DUCKDB,
            _ => COMMON,
        }
    }

    /// Whether a function name is an aggregate in this dialect.
    pub fn is_aggregate_function(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.aggregate_functions().contains(&lower.as_str())
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_uppercases_and_quotes() {
        assert_eq!(Dialect::Snowflake.normalize_identifier("abc"), "\"ABC\"");
    }

    #[test]
    fn test_postgres_lowercases_and_quotes() {
        assert_eq!(Dialect::Postgres.normalize_identifier("ABC"), "\"abc\"");
        assert_eq!(Dialect::Redshift.normalize_identifier("MiXeD"), "\"mixed\"");
    }

    #[test]
    fn test_mysql_backticks_and_preserves_case() {
        assert_eq!(Dialect::Mysql.normalize_identifier("abc"), "`abc`");
        assert_eq!(Dialect::Bigquery.normalize_identifier("aBc"), "`aBc`");
    }

    #[test]
    fn test_duckdb_preserves_case_with_double_quotes() {
        assert_eq!(Dialect::Duckdb.normalize_identifier("aBc"), "\"aBc\"");
    }

    #[test]
    fn test_embedded_quote_is_doubled() {
        assert_eq!(
            Dialect::Duckdb.normalize_identifier("we\"ird"),
            "\"we\"\"ird\""
        );
        assert_eq!(Dialect::Mysql.normalize_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_normalization_is_stable() {
        // SELECT alias / GROUP BY / ORDER BY must agree byte-for-byte.
        let a = Dialect::Snowflake.normalize_identifier("c_12ab34cd");
        let b = Dialect::Snowflake.normalize_identifier("c_12ab34cd");
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_name_aliases() {
        assert_eq!(Dialect::from_name("PostgreSQL"), Dialect::Postgres);
        assert_eq!(Dialect::from_name("duckdb"), Dialect::Duckdb);
        assert_eq!(Dialect::from_name("MariaDB"), Dialect::Mysql);
        assert_eq!(Dialect::from_name("no-such-db"), Dialect::Generic);
    }

    #[test]
    fn test_aggregate_tables_are_dialect_specific() {
        assert!(Dialect::Mysql.is_aggregate_function("GROUP_CONCAT"));
        assert!(!Dialect::Postgres.is_aggregate_function("group_concat"));
        assert!(Dialect::Snowflake.is_aggregate_function("listagg"));
        assert!(Dialect::Duckdb.is_aggregate_function("arg_max"));
        assert!(Dialect::Generic.is_aggregate_function("STDDEV_POP"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            Dialect::Postgres.normalize_path(&["Orders", "Amount"]),
            "\"orders\".\"amount\""
        );
    }
}
