//! System-record protection.
//!
//! Tables may declare a boolean `systemFlag` column. Records with the flag set
//! cannot be deleted, cannot have non-exempt fields changed, and cannot be
//! attached to or detached from other records through relations. Records
//! cannot be created with the flag already set.
#![allow(missing_docs)]

use thiserror::Error;

use crate::catalog::{ScalarType, TableDef};
use crate::query::sql::{column_ref, quote_ident, Statement};
use crate::query::value::SqlValue;
use crate::store::StoreSession;
use crate::Result;

/// A mutation was rejected because it touches a system record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtectionViolation {
    #[error("cannot create a '{table}' record flagged as system")]
    Create { table: String },
    #[error("cannot delete system record {id} of '{table}'")]
    Delete { table: String, id: String },
    #[error("cannot change '{field}' of system record {id} of '{table}'")]
    Field {
        table: String,
        id: String,
        field: String,
    },
    #[error("cannot {action} system record(s) {ids} of '{table}' through '{relation}'")]
    Relation {
        table: String,
        relation: String,
        action: &'static str,
        ids: String,
    },
}

impl ProtectionViolation {
    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ProtectionViolation::Create { .. } => "SystemCreate",
            ProtectionViolation::Delete { .. } => "SystemDelete",
            ProtectionViolation::Field { .. } => "SystemField",
            ProtectionViolation::Relation { .. } => "SystemRelation",
        }
    }
}

/// Truthiness of a stored flag cell.
pub(crate) fn flag_set(value: &SqlValue) -> bool {
    match value {
        SqlValue::Bool(b) => *b,
        SqlValue::Int(i) => *i != 0,
        SqlValue::Float(f) => *f != 0.0,
        SqlValue::Text(s) => matches!(s.as_str(), "1" | "true" | "TRUE" | "True"),
        SqlValue::Null | SqlValue::Bytes(_) => false,
    }
}

/// Equality across the representations a driver may hand back for the same
/// logical value (`1` vs `true`, `3` vs `3.0`).
pub(crate) fn same_value(stored: &SqlValue, incoming: &SqlValue, ty: ScalarType) -> bool {
    if ty == ScalarType::Bool && !stored.is_null() && !incoming.is_null() {
        return flag_set(stored) == flag_set(incoming);
    }
    match (stored, incoming) {
        (SqlValue::Int(a), SqlValue::Float(b)) | (SqlValue::Float(b), SqlValue::Int(a)) => {
            (*a as f64) == *b
        }
        (SqlValue::Bool(a), SqlValue::Int(b)) | (SqlValue::Int(b), SqlValue::Bool(a)) => {
            i64::from(*a) == *b
        }
        (SqlValue::Text(a), SqlValue::Int(b)) | (SqlValue::Int(b), SqlValue::Text(a)) => {
            a.trim() == b.to_string()
        }
        (a, b) => a == b,
    }
}

/// Rejects creating a record whose payload sets the system flag.
pub(crate) fn check_create(
    table: &TableDef,
    columns: &[(String, SqlValue)],
) -> std::result::Result<(), ProtectionViolation> {
    let Some(flag) = &table.system_flag else {
        return Ok(());
    };
    if columns.iter().any(|(name, value)| name == flag && flag_set(value)) {
        return Err(ProtectionViolation::Create {
            table: table.name.clone(),
        });
    }
    Ok(())
}

/// True when `stored` is a system record of `table`.
pub(crate) fn is_system(table: &TableDef, stored: &[(String, SqlValue)]) -> bool {
    let Some(flag) = &table.system_flag else {
        return false;
    };
    stored
        .iter()
        .any(|(name, value)| name == flag && flag_set(value))
}

/// Rejects changing a non-exempt column of a system record.
pub(crate) fn check_update(
    table: &TableDef,
    id: &str,
    stored: &[(String, SqlValue)],
    changes: &[(String, SqlValue)],
) -> std::result::Result<(), ProtectionViolation> {
    if !is_system(table, stored) {
        return Ok(());
    }
    for (field, incoming) in changes {
        if table.is_exempt(field) {
            continue;
        }
        let ty = table
            .column(field)
            .map(|c| c.scalar_type)
            .unwrap_or(ScalarType::Text);
        let unchanged = stored
            .iter()
            .find(|(name, _)| name == field)
            .is_some_and(|(_, current)| same_value(current, incoming, ty));
        if !unchanged {
            return Err(ProtectionViolation::Field {
                table: table.name.clone(),
                id: id.to_string(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// Rejects attaching or detaching system records of `target`, identified by
/// `key` values.
pub(crate) fn check_links(
    session: &dyn StoreSession,
    target: &TableDef,
    key: &str,
    relation: &str,
    action: &'static str,
    ids: &[SqlValue],
) -> Result<()> {
    let Some(flag) = &target.system_flag else {
        return Ok(());
    };
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let statement = Statement {
        sql: format!(
            "SELECT {} FROM {} AS \"t\" WHERE {} IN ({placeholders}) AND {} <> 0",
            column_ref("t", key),
            quote_ident(&target.name),
            column_ref("t", key),
            column_ref("t", flag)
        ),
        params: ids.to_vec(),
    };
    let rows = session.query(&statement)?;
    if rows.is_empty() {
        return Ok(());
    }
    let ids = rows
        .rows
        .iter()
        .filter_map(|row| row.first())
        .map(|id| id.to_json(None).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(ProtectionViolation::Relation {
        table: target.name.clone(),
        relation: relation.to_string(),
        action,
        ids,
    }
    .into())
}
