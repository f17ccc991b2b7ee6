//! Crate-wide error type for catalog, compilation, storage, and repository
//! failures.
#![forbid(unsafe_code)]

use std::io;

use thiserror::Error;

use crate::query::errors::CompileError;
use crate::repository::ProtectionViolation;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the query layer, the repository, and the store.
#[derive(Debug, Error)]
pub enum Error {
    /// The request could not be lowered into SQL.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// A mutation touched a protected system record.
    #[error(transparent)]
    Protection(#[from] ProtectionViolation),
    /// The referenced record does not exist.
    #[error("{table} record {id} not found")]
    NotFound {
        /// Table that was searched.
        table: String,
        /// Primary key rendered as text.
        id: String,
    },
    /// The caller supplied an argument that failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The schema catalog is inconsistent.
    #[error("invalid catalog: {0}")]
    Catalog(String),
    /// The relational store rejected a statement.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    /// A JSON payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Builds an [`Error::NotFound`] for a table and primary key.
    pub fn not_found(table: impl Into<String>, id: impl ToString) -> Self {
        Error::NotFound {
            table: table.into(),
            id: id.to_string(),
        }
    }

    /// HTTP-style status code the outer transport layer should report.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Compile(_) | Error::InvalidArgument(_) => 400,
            Error::Protection(_) => 403,
            Error::NotFound { .. } => 404,
            Error::Catalog(_) | Error::Store(_) | Error::Json(_) | Error::Io(_) => 500,
        }
    }

    /// Returns true when the failure was caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}
