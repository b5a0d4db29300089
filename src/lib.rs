pub mod classify;
pub mod clauses;
pub mod codec;
pub mod compile;
pub mod dag;
pub mod diagnostics;
pub mod dialect;
pub mod error;
pub mod lineage;
pub mod refs;
pub mod schema;

pub use compile::{Compiler, QueryInfo};

pub mod prelude {
    pub use crate::compile::{Compiler, QueryInfo};
    pub use crate::dag::*;
    pub use crate::dialect::{CLIENT_DIALECT, Dialect};
    pub use crate::error::*;
    pub use crate::schema::{Backend, Backends, SchemaCache, SqlResult};
}
