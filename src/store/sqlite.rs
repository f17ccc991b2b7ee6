use std::path::Path;

use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, trace};

use crate::query::sql::Statement;
use crate::query::value::SqlValue;
use crate::Result;

use super::{ExecOutcome, RelationalStore, RowSet, StoreSession};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn cell(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    }
}

/// Lower-cases `text` and strips diacritics from Latin letters.
pub fn fold_accents(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars().flat_map(char::to_lowercase) {
        match ch {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => out.push('a'),
            'ç' | 'ć' | 'č' => out.push('c'),
            'ď' | 'đ' => out.push('d'),
            'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => out.push('e'),
            'ğ' => out.push('g'),
            'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => out.push('i'),
            'ł' | 'ľ' => out.push('l'),
            'ñ' | 'ń' | 'ň' => out.push('n'),
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => out.push('o'),
            'ř' => out.push('r'),
            'ś' | 'š' | 'ş' => out.push('s'),
            'ť' | 'ţ' => out.push('t'),
            'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => out.push('u'),
            'ý' | 'ÿ' => out.push('y'),
            'ź' | 'ż' | 'ž' => out.push('z'),
            'ß' => out.push_str("ss"),
            'æ' => out.push_str("ae"),
            'œ' => out.push_str("oe"),
            other => out.push(other),
        }
    }
    out
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "unaccent",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            Ok(match ctx.get_raw(0) {
                ValueRef::Null => None,
                ValueRef::Text(bytes) => Some(fold_accents(&String::from_utf8_lossy(bytes))),
                ValueRef::Integer(i) => Some(i.to_string()),
                ValueRef::Real(f) => Some(f.to_string()),
                ValueRef::Blob(bytes) => Some(fold_accents(&String::from_utf8_lossy(bytes))),
            })
        },
    )
}

fn run_query(conn: &Connection, statement: &Statement) -> Result<RowSet> {
    trace!(sql = %statement.sql, params = statement.params.len(), "query");
    let mut prepared = conn.prepare(&statement.sql)?;
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();
    let mut rows = prepared.query(params_from_iter(statement.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for idx in 0..width {
            cells.push(cell(row.get_ref(idx)?));
        }
        out.push(cells);
    }
    Ok(RowSet { columns, rows: out })
}

fn run_execute(conn: &Connection, statement: &Statement) -> Result<ExecOutcome> {
    trace!(sql = %statement.sql, params = statement.params.len(), "execute");
    let mut prepared = conn.prepare(&statement.sql)?;
    let rows_affected = prepared.execute(params_from_iter(statement.params.iter()))? as u64;
    let rowid = conn.last_insert_rowid();
    Ok(ExecOutcome {
        rows_affected,
        last_insert_id: (rowid != 0).then_some(rowid),
    })
}

struct ConnSession<'a>(&'a Connection);

impl StoreSession for ConnSession<'_> {
    fn query(&self, statement: &Statement) -> Result<RowSet> {
        run_query(self.0, statement)
    }

    fn execute(&self, statement: &Statement) -> Result<ExecOutcome> {
        run_execute(self.0, statement)
    }
}

/// SQLite-backed store. One connection serialized behind a mutex; callers on
/// async runtimes should reach it through `spawn_blocking`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        debug!(path = %path.as_ref().display(), "opened sqlite store");
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        register_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs a batch of semicolon separated statements, typically DDL.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl StoreSession for SqliteStore {
    fn query(&self, statement: &Statement) -> Result<RowSet> {
        run_query(&self.conn.lock(), statement)
    }

    fn execute(&self, statement: &Statement) -> Result<ExecOutcome> {
        run_execute(&self.conn.lock(), statement)
    }
}

impl RelationalStore for SqliteStore {
    fn transaction(&self, work: &mut dyn FnMut(&dyn StoreSession) -> Result<()>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        work(&ConnSession(&*tx))?;
        tx.commit()?;
        Ok(())
    }
}
