//! SQL text fragments with positional parameters.

use std::fmt::Write as _;

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

use super::value::SqlValue;

/// Quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders `"alias"."column"`.
pub fn column_ref(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}

/// A piece of SQL whose `?` placeholders bind `params` in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SqlFragment {
    /// SQL text.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    /// Fragment without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Fragment with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Joins fragments with `separator`, concatenating parameters in order.
    pub fn join(parts: Vec<SqlFragment>, separator: &str) -> Self {
        let mut out = SqlFragment::default();
        for (idx, part) in parts.into_iter().enumerate() {
            if idx > 0 {
                out.sql.push_str(separator);
            }
            out.push(part);
        }
        out
    }

    /// Wraps the text in `prefix` and `suffix`.
    pub fn wrap(mut self, prefix: &str, suffix: &str) -> Self {
        self.sql = format!("{prefix}{}{suffix}", self.sql);
        self
    }

    /// Appends another fragment.
    pub fn push(&mut self, other: SqlFragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    /// Appends raw text.
    pub fn push_str(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }
}

/// A complete statement ready for the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Statement {
    /// SQL text.
    pub sql: String,
    /// Bound parameters.
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// Stable 64-bit fingerprint of the SQL text, used for log correlation.
    pub fn fingerprint(&self) -> u64 {
        xxh64(self.sql.as_bytes(), 0)
    }

    /// Fingerprint as 16 hex digits.
    pub fn fingerprint_hex(&self) -> String {
        let mut out = String::with_capacity(16);
        let _ = write!(out, "{:016x}", self.fingerprint());
        out
    }
}

impl From<SqlFragment> for Statement {
    fn from(fragment: SqlFragment) -> Self {
        Statement {
            sql: fragment.sql,
            params: fragment.params,
        }
    }
}
