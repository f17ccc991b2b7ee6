//! Relational store abstraction consumed by the assembler and the
//! repository.
//!
//! The query layer only ever hands the store complete [`Statement`]s; it
//! never sees connections or driver types. [`SqliteStore`] is the bundled
//! implementation.

use crate::query::sql::Statement;
use crate::query::value::SqlValue;
use crate::Result;

mod sqlite;

pub use sqlite::{fold_accents, SqliteStore};

/// Rows returned by a query, cells in select order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowSet {
    /// Column names as reported by the driver.
    pub columns: Vec<String>,
    /// Row cells.
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    /// First cell of the first row.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }

    /// True when no row came back.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of a write statement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Rows inserted, updated, or deleted.
    pub rows_affected: u64,
    /// Rowid of the last insert on this connection.
    pub last_insert_id: Option<i64>,
}

/// Something statements can run against: the store itself or an open
/// transaction.
pub trait StoreSession {
    /// Runs a read statement.
    fn query(&self, statement: &Statement) -> Result<RowSet>;

    /// Runs a write statement.
    fn execute(&self, statement: &Statement) -> Result<ExecOutcome>;
}

/// A shareable store that can also run work atomically.
pub trait RelationalStore: StoreSession + Send + Sync {
    /// Runs `work` inside one transaction, committing when it returns `Ok`
    /// and rolling back otherwise.
    fn transaction(&self, work: &mut dyn FnMut(&dyn StoreSession) -> Result<()>) -> Result<()>;
}

impl StoreSession for std::sync::Arc<dyn RelationalStore> {
    fn query(&self, statement: &Statement) -> Result<RowSet> {
        (**self).query(statement)
    }

    fn execute(&self, statement: &Statement) -> Result<ExecOutcome> {
        (**self).execute(statement)
    }
}
