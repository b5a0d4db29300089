//! Error types for vizier.

use thiserror::Error;

/// Errors raised while compiling or analyzing a single expression or entity.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// A `${ref(name)}` token names an entity absent from the dependency graph.
    #[error("reference '{name}' not found{}", suggestion_suffix(.suggestion))]
    ReferenceNotFound {
        name: String,
        suggestion: Option<String>,
    },

    /// An Input's option query must reference exactly one Model.
    #[error("input '{input}' options query must reference exactly one model, found {found}")]
    ReferenceArity { input: String, found: usize },

    /// The expression is not valid SQL in the active dialect.
    #[error("parse error ({dialect}): {message}")]
    Parse { dialect: String, message: String },

    /// Schema extraction failed; callers degrade to an empty schema.
    #[error("schema unavailable for '{model}' on source '{source_name}': {message}")]
    SchemaUnavailable {
        source_name: String,
        model: String,
        message: String,
    },

    /// A codec marker names an Input that does not exist.
    #[error("undefined input '{name}' in deferred placeholder")]
    UndefinedInput { name: String },

    /// An Input's option query produced no usable value.
    #[error("input '{input}' option resolution failed: {message}")]
    InputQuery { input: String, message: String },

    /// Reference macros (metrics/dimensions) expanded past the depth limit.
    #[error("reference cycle while expanding '{name}'")]
    ReferenceCycle { name: String },

    /// A compiled query failed against a live backend. Raised by the job
    /// layer, never by the compiler itself.
    #[error("execution failed: {message}")]
    Execution {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },
}

impl Error {
    /// Create a parse error from a sqlparser failure.
    pub fn parse(dialect: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            dialect: dialect.into(),
            message: message.to_string(),
        }
    }

    /// Schema errors never abort a run; this flags them for callers that log.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SchemaUnavailable { .. })
    }
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(". Did you mean '{s}'?"),
        None => String::new(),
    }
}

/// A compile failure tied to the Insight and expression that caused it.
///
/// Compile errors abort only the offending Insight; the enclosing job layer
/// keeps compiling siblings.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("insight '{insight}' at {path}: {source} (expression: {expression})")]
pub struct CompileError {
    pub insight: String,
    pub path: String,
    pub expression: String,
    #[source]
    pub source: Error,
}

impl CompileError {
    pub fn new(
        insight: impl Into<String>,
        path: impl Into<String>,
        expression: impl Into<String>,
        source: Error,
    ) -> Self {
        Self {
            insight: insight.into(),
            path: path.into(),
            expression: expression.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
pub type CompileResult<T> = std::result::Result<T, CompileError>;
