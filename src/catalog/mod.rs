//! Read-only schema catalog consumed by the query compiler.
//!
//! A [`SchemaCatalog`] is an immutable snapshot of table shapes: columns with
//! their scalar types, and relations with the keys needed to join them. The
//! compiler borrows one snapshot per request; nothing in this module mutates a
//! snapshot after construction. Catalog persistence lives elsewhere, so the
//! only ways in are [`SchemaCatalog::new`], JSON documents, and the fluent
//! builders on [`TableDef`] and [`RelationDef`] used by tests and tooling.
#![forbid(unsafe_code)]

mod source;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use source::{CatalogSource, StaticCatalog, SwappableCatalog};

/// Scalar column types understood by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// Signed 64-bit integer.
    Int,
    /// Double precision float.
    Float,
    /// Boolean, stored as 0/1 by SQLite.
    Bool,
    /// UTF-8 text.
    Text,
    /// Calendar date (ISO 8601 text).
    Date,
    /// Timestamp (ISO 8601 text).
    #[serde(alias = "timestamp")]
    DateTime,
    /// JSON document stored as text.
    Json,
    /// UUID stored as text.
    Uuid,
}

impl ScalarType {
    /// Integer or float.
    pub fn is_numeric(self) -> bool {
        matches!(self, ScalarType::Int | ScalarType::Float)
    }

    /// Date or timestamp.
    pub fn is_temporal(self) -> bool {
        matches!(self, ScalarType::Date | ScalarType::DateTime)
    }
}

/// One scalar column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column name as stored.
    pub name: String,
    /// Declared scalar type.
    #[serde(rename = "type")]
    pub scalar_type: ScalarType,
    /// Whether NULL is allowed.
    #[serde(default)]
    pub nullable: bool,
}

/// Relation cardinality as seen from the owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// At most one related record.
    One,
    /// Any number of related records.
    Many,
}

/// Link table backing a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JunctionDef {
    /// Link table name.
    pub table: String,
    /// Link column that references the owning table's join key.
    pub source_key: String,
    /// Link column that references the target table's inverse join key.
    pub target_key: String,
}

/// A named relation from one table to another.
///
/// Without a junction the join condition is
/// `target.inverse_join_key = parent.join_key`. With a junction it becomes
/// `link.source_key = parent.join_key` followed by
/// `target.inverse_join_key = link.target_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDef {
    /// Relation name used in filter and field paths.
    pub name: String,
    /// One or many.
    pub cardinality: Cardinality,
    /// Target table name.
    pub target_table: String,
    /// Column on the owning table.
    pub join_key: String,
    /// Column on the target table.
    pub inverse_join_key: String,
    /// Optional junction table for many-to-many relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction: Option<JunctionDef>,
}

/// Correlated link used by subquery operators (`count`, `eq_set`): the table
/// holding one row per related record, the column pointing back at the
/// parent, and the column identifying the related record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSpec<'a> {
    /// Table scanned by the subquery.
    pub table: &'a str,
    /// Column compared against the parent's join key.
    pub parent_key: &'a str,
    /// Column identifying the related record.
    pub target_key: &'a str,
}

impl RelationDef {
    /// Owning side of a to-one relation: `join_key` is a foreign key column on
    /// the parent, `inverse_join_key` is usually the target's primary key.
    pub fn one(
        name: impl Into<String>,
        target: impl Into<String>,
        join_key: impl Into<String>,
        inverse_join_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::One,
            target_table: target.into(),
            join_key: join_key.into(),
            inverse_join_key: inverse_join_key.into(),
            junction: None,
        }
    }

    /// Inverse side of a one-to-many relation.
    pub fn many(
        name: impl Into<String>,
        target: impl Into<String>,
        join_key: impl Into<String>,
        inverse_join_key: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::one(name, target, join_key, inverse_join_key)
        }
    }

    /// Many-to-many relation through `junction`, joining primary keys named `id`.
    pub fn many_through(
        name: impl Into<String>,
        target: impl Into<String>,
        junction: impl Into<String>,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        Self {
            junction: Some(JunctionDef {
                table: junction.into(),
                source_key: source_key.into(),
                target_key: target_key.into(),
            }),
            ..Self::many(name, target, "id", "id")
        }
    }

    /// True for to-many relations.
    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    /// True when the parent row stores the foreign key itself.
    pub fn is_owning(&self, parent: &TableDef) -> bool {
        self.cardinality == Cardinality::One
            && self.junction.is_none()
            && self.join_key != parent.primary_key
    }

    /// Link description for correlated subqueries.
    pub fn link<'a>(&'a self, target: &'a TableDef) -> LinkSpec<'a> {
        match &self.junction {
            Some(junction) => LinkSpec {
                table: &junction.table,
                parent_key: &junction.source_key,
                target_key: &junction.target_key,
            },
            None => LinkSpec {
                table: &target.name,
                parent_key: &self.inverse_join_key,
                target_key: &target.primary_key,
            },
        }
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}

/// Shape of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Primary key column.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Scalar columns, including the primary key.
    pub columns: Vec<ColumnDef>,
    /// Relations owned by this table.
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    /// Boolean column marking immutable system records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_flag: Option<String>,
    /// Fields that stay editable on system records.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exempt_fields: Vec<String>,
    /// Cache scope invalidated after any mutation on this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_scope: Option<String>,
}

impl TableDef {
    /// Starts a table with an integer `id` primary key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
            columns: vec![ColumnDef {
                name: default_primary_key(),
                scalar_type: ScalarType::Int,
                nullable: false,
            }],
            relations: Vec::new(),
            system_flag: None,
            exempt_fields: Vec::new(),
            cache_scope: None,
        }
    }

    /// Adds a non-null column.
    pub fn with_column(mut self, name: impl Into<String>, scalar_type: ScalarType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            scalar_type,
            nullable: false,
        });
        self
    }

    /// Adds a nullable column.
    pub fn with_nullable(mut self, name: impl Into<String>, scalar_type: ScalarType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            scalar_type,
            nullable: true,
        });
        self
    }

    /// Adds a relation.
    pub fn with_relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    /// Marks records with `column = true` as immutable.
    pub fn with_system_flag(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if self.column(&column).is_none() {
            self.columns.push(ColumnDef {
                name: column.clone(),
                scalar_type: ScalarType::Bool,
                nullable: false,
            });
        }
        self.system_flag = Some(column);
        self
    }

    /// Fields that may still change on system records.
    pub fn with_exempt_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Cache scope to invalidate after mutations.
    pub fn with_cache_scope(mut self, scope: impl Into<String>) -> Self {
        self.cache_scope = Some(scope.into());
        self
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|col| col.name == name)
    }

    /// Looks up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|rel| rel.name == name)
    }

    /// Scalar type of the primary key.
    pub fn primary_type(&self) -> ScalarType {
        self.column(&self.primary_key)
            .map(|col| col.scalar_type)
            .unwrap_or(ScalarType::Int)
    }

    /// True if `field` stays editable on system records.
    pub fn is_exempt(&self, field: &str) -> bool {
        self.exempt_fields.iter().any(|f| f == field)
    }
}

/// Immutable set of table definitions.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: HashMap<String, TableDef>,
    order: Vec<String>,
}

#[derive(Deserialize)]
struct CatalogDocument {
    tables: Vec<TableDef>,
}

impl SchemaCatalog {
    /// Builds and validates a catalog.
    pub fn new(tables: Vec<TableDef>) -> Result<Self> {
        let mut catalog = SchemaCatalog::default();
        for table in tables {
            if catalog.tables.contains_key(&table.name) {
                return Err(Error::Catalog(format!("duplicate table '{}'", table.name)));
            }
            catalog.order.push(table.name.clone());
            catalog.tables.insert(table.name.clone(), table);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parses a `{"tables": [...]}` JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_json::from_str(text)?;
        Self::new(doc.tables)
    }

    /// Reads a catalog document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Tables in declaration order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.order.iter().filter_map(|name| self.tables.get(name))
    }

    /// Resolves the target table of `relation`.
    pub fn target_of(&self, relation: &RelationDef) -> Option<&TableDef> {
        self.tables.get(&relation.target_table)
    }

    fn validate(&self) -> Result<()> {
        for table in self.tables() {
            if table.column(&table.primary_key).is_none() {
                return Err(Error::Catalog(format!(
                    "table '{}' has no primary key column '{}'",
                    table.name, table.primary_key
                )));
            }
            if let Some(flag) = &table.system_flag {
                if table.column(flag).is_none() {
                    return Err(Error::Catalog(format!(
                        "table '{}' system flag '{flag}' is not a column",
                        table.name
                    )));
                }
            }
            for rel in &table.relations {
                if table.column(&rel.name).is_some() {
                    return Err(Error::Catalog(format!(
                        "table '{}' declares '{}' as both column and relation",
                        table.name, rel.name
                    )));
                }
                let Some(target) = self.target_of(rel) else {
                    return Err(Error::Catalog(format!(
                        "relation '{}.{}' targets unknown table '{}'",
                        table.name, rel.name, rel.target_table
                    )));
                };
                if table.column(&rel.join_key).is_none() {
                    return Err(Error::Catalog(format!(
                        "relation '{}.{}' join key '{}' is not a column",
                        table.name, rel.name, rel.join_key
                    )));
                }
                if target.column(&rel.inverse_join_key).is_none() {
                    return Err(Error::Catalog(format!(
                        "relation '{}.{}' inverse key '{}' is not a column of '{}'",
                        table.name, rel.name, rel.inverse_join_key, target.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relation_to_unknown_table() {
        let err = SchemaCatalog::new(vec![TableDef::new("posts")
            .with_column("authorId", ScalarType::Int)
            .with_relation(RelationDef::one("author", "users", "authorId", "id"))])
        .expect_err("missing target");
        assert!(matches!(err, Error::Catalog(msg) if msg.contains("unknown table 'users'")));
    }

    #[test]
    fn parses_json_document() {
        let catalog = SchemaCatalog::from_json(
            r#"{"tables": [
                {"name": "users", "columns": [
                    {"name": "id", "type": "int"},
                    {"name": "name", "type": "text"},
                    {"name": "createdAt", "type": "timestamp", "nullable": true}
                ], "relations": [
                    {"name": "posts", "cardinality": "many", "targetTable": "posts",
                     "joinKey": "id", "inverseJoinKey": "authorId"}
                ], "exemptFields": ["name"], "cacheScope": "route"},
                {"name": "posts", "columns": [
                    {"name": "id", "type": "int"},
                    {"name": "authorId", "type": "int"}
                ]}
            ]}"#,
        )
        .expect("catalog parses");
        let users = catalog.table("users").expect("users table");
        assert_eq!(users.primary_key, "id");
        assert_eq!(
            users.column("createdAt").map(|c| c.scalar_type),
            Some(ScalarType::DateTime)
        );
        assert!(users.relation("posts").expect("posts relation").is_many());
        assert!(users.is_exempt("name"));
        assert_eq!(users.cache_scope.as_deref(), Some("route"));
        assert_eq!(
            catalog.tables().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["users", "posts"]
        );
    }

    #[test]
    fn system_flag_must_be_a_column() {
        let mut table = TableDef::new("routes");
        table.system_flag = Some("isSystem".into());
        let err = SchemaCatalog::new(vec![table]).expect_err("undeclared flag");
        assert!(matches!(err, Error::Catalog(msg) if msg.contains("system flag")));
    }

    #[test]
    fn link_spec_prefers_junction() {
        let tags = TableDef::new("tags").with_column("label", ScalarType::Text);
        let rel = RelationDef::many_through("tags", "tags", "post_tags", "postId", "tagId");
        let link = rel.link(&tags);
        assert_eq!(link.table, "post_tags");
        assert_eq!(link.parent_key, "postId");
        assert_eq!(link.target_key, "tagId");

        let posts = TableDef::new("posts").with_column("authorId", ScalarType::Int);
        let rel = RelationDef::many("posts", "posts", "id", "authorId");
        let link = rel.link(&posts);
        assert_eq!(link.table, "posts");
        assert_eq!(link.parent_key, "authorId");
        assert_eq!(link.target_key, "id");
    }
}
