#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Structured errors emitted while compiling a find request.
///
/// Every variant is a client error: the request itself is malformed or
/// names something the catalog does not know. Nothing here is retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The root table is absent from the catalog.
    #[error("unknown table '{table}'")]
    UnknownTable { table: String },
    /// A path segment does not resolve (strict mode only).
    #[error("path '{path}' does not resolve against table '{table}'")]
    UnresolvedPath { table: String, path: String },
    /// Operator is not legal for the kind of field it targets.
    #[error("operator '{op}' is not valid on '{path}': {reason}")]
    InvalidOperator {
        path: String,
        op: String,
        reason: &'static str,
    },
    /// Operand has the wrong shape for its operator.
    #[error("operator '{op}' on '{path}' expects {expected}")]
    MalformedOperand {
        path: String,
        op: String,
        expected: &'static str,
    },
    /// Filter document is not a well-formed tree.
    #[error("malformed filter: {reason}")]
    MalformedFilter { reason: String },
    /// Sort path cannot be ordered by.
    #[error("cannot sort by '{path}': {reason}")]
    InvalidSort { path: String, reason: &'static str },
    /// Aggregate target is missing or of the wrong type.
    #[error("{function}('{path}') rejected: {reason}")]
    InvalidAggregate {
        function: String,
        path: String,
        reason: &'static str,
    },
    /// Aggregate function name is not one of count/sum/avg/min/max.
    #[error("unknown aggregate function '{function}'")]
    UnknownAggregateFunction { function: String },
    /// Aggregate document is not a well-formed map.
    #[error("malformed aggregate: {reason}")]
    MalformedAggregate { reason: String },
    /// Metadata mode is not `totalCount`, `filterCount`, or `*`.
    #[error("unknown meta mode '{value}'")]
    InvalidMeta { value: String },
    /// Configured root alias is empty or shadows a generated alias.
    #[error("root alias '{alias}' is not usable: {reason}")]
    InvalidRootAlias { alias: String, reason: &'static str },
}

impl CompileError {
    /// Builds a [`CompileError::MalformedOperand`].
    pub fn operand(path: impl ToString, op: impl ToString, expected: &'static str) -> Self {
        CompileError::MalformedOperand {
            path: path.to_string(),
            op: op.to_string(),
            expected,
        }
    }

    /// Builds a [`CompileError::InvalidOperator`].
    pub fn invalid_op(path: impl ToString, op: impl ToString, reason: &'static str) -> Self {
        CompileError::InvalidOperator {
            path: path.to_string(),
            op: op.to_string(),
            reason,
        }
    }

    /// Builds a [`CompileError::MalformedFilter`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        CompileError::MalformedFilter {
            reason: reason.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::UnknownTable { .. } => "UnknownTable",
            CompileError::UnresolvedPath { .. } => "UnresolvedPath",
            CompileError::InvalidOperator { .. } => "InvalidOperator",
            CompileError::MalformedOperand { .. } => "MalformedOperand",
            CompileError::MalformedFilter { .. } => "MalformedFilter",
            CompileError::InvalidSort { .. } => "InvalidSort",
            CompileError::InvalidAggregate { .. } => "InvalidAggregate",
            CompileError::UnknownAggregateFunction { .. } => "InvalidAggregate",
            CompileError::MalformedAggregate { .. } => "InvalidAggregate",
            CompileError::InvalidMeta { .. } => "InvalidMeta",
            CompileError::InvalidRootAlias { .. } => "InvalidOptions",
        }
    }
}

/// Convenience wrapper that formats compile errors with their codes.
pub struct CompileErrorWithCode<'a>(pub &'a CompileError);

impl fmt::Display for CompileErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
