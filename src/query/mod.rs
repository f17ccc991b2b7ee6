#![forbid(unsafe_code)]

//! Dynamic query compiler.
//!
//! Lowers declarative find requests (filter, fields, sort, pagination, meta,
//! aggregates) into parameterized SQL against a [`SchemaCatalog`] snapshot,
//! then runs the statements and reshapes flat rows into nested records.
//!
//! [`SchemaCatalog`]: crate::catalog::SchemaCatalog

/// Aggregate resolution and rendering.
pub mod aggregate;

/// Alias memoization and the join plan.
pub mod alias;

/// Statement execution and response assembly.
pub mod assembler;

/// Parsed forms of the request DSLs.
pub mod ast;

mod context;

/// Compile-time errors.
pub mod errors;

/// Filter compilation.
pub mod filter;

/// Request planning: ties every compiler together.
pub mod plan;

/// Env-gated timing counters.
///
/// Collects timing and count statistics when `DYNCORE_PROFILE` is set.
pub mod profile;

/// Select list construction and row hydration.
pub mod projection;

/// Sort compilation.
pub mod sort;

/// SQL fragments and statements.
pub mod sql;

/// Bound parameter and cell values.
pub mod value;

#[cfg(test)]
mod fixtures;

pub use assembler::{execute_find, FindMeta, FindResult};
pub use context::{CompileOptions, PathPolicy};
pub use errors::CompileError;
pub use plan::{compile_find, FindPlan, FindRequest, Window};
pub use sql::Statement;
pub use value::SqlValue;
