//! Dyncore: the query compiler and sandboxed handler runtime behind a
//! metadata-driven backend.
//!
//! The [`query`] layer lowers declarative find requests into parameterized
//! SQL against a [`catalog::SchemaCatalog`], the [`repository`] layer wraps
//! it with CRUD and system-record protection, and the [`executor`] runs
//! untrusted handler scripts in pooled workers that reach back into the host
//! only through typed remote calls.

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod query;
pub mod repository;
pub mod store;

pub use error::{Error, Result};
