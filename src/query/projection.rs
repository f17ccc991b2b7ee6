//! Projection and join resolution, plus the row hydration that turns flat
//! joined rows back into nested records.
//!
//! A bare scalar path selects that column. A bare relation path selects only
//! the related primary key. A trailing `*` selects every scalar of the table
//! it follows plus the primary key of each of that table's direct relations.
//! An empty field list means `*` at the root. The root primary key and the
//! primary key of every joined relation are always selected so hydration can
//! deduplicate rows.
//!
//! To-many relations that only a wildcard reaches are not joined. Their keys
//! are loaded afterwards by one keyed query per relation ([`DeferredLink`]),
//! so a bare find never multiplies rows across unrelated collections.

use std::collections::HashMap;

use serde_json::{Map, Value as Json};

use crate::catalog::{RelationDef, ScalarType, TableDef};

use super::alias::JoinUsage;
use super::ast::FieldPath;
use super::context::{Hop, QueryContext, Resolved};
use super::errors::CompileError;
use super::sql::{column_ref, quote_ident, Statement};
use super::value::SqlValue;

/// One entry of the select list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectColumn {
    /// Table alias.
    pub alias: String,
    /// Column name.
    pub column: String,
    /// Column type, used when rendering the cell.
    pub scalar_type: ScalarType,
}

impl SelectColumn {
    /// `"alias"."column"`.
    pub fn sql(&self) -> String {
        column_ref(&self.alias, &self.column)
    }
}

/// A scalar field of a hydrated object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSlot {
    /// Output key.
    pub name: String,
    /// Index into the select list.
    pub slot: usize,
}

/// Nested relation of a hydrated object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationShape {
    /// Output key.
    pub name: String,
    /// Array when true, object or null otherwise.
    pub many: bool,
    /// Shape of each related object.
    pub shape: ObjectShape,
}

/// How to assemble one object from a flat row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectShape {
    /// Primary key column name.
    pub pk_name: String,
    /// Select-list index of the primary key.
    pub pk_slot: usize,
    /// Scalar fields in selection order.
    pub fields: Vec<FieldSlot>,
    /// Nested relations in selection order.
    pub relations: Vec<RelationShape>,
}

impl ObjectShape {
    fn new(pk_name: &str, pk_slot: usize) -> Self {
        Self {
            pk_name: pk_name.to_string(),
            pk_slot,
            fields: vec![FieldSlot {
                name: pk_name.to_string(),
                slot: pk_slot,
            }],
            relations: Vec::new(),
        }
    }

    fn add_field(&mut self, name: &str, slot: usize) {
        if !self.fields.iter().any(|f| f.name == name) {
            self.fields.push(FieldSlot {
                name: name.to_string(),
                slot,
            });
        }
    }
}

/// A to-many relation reached only through a wildcard, loaded by a keyed
/// query once the page of parent records is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredLink {
    /// Relation names leading from the root to the parent objects.
    pub parent_path: Vec<String>,
    /// Output key on each parent object.
    pub name: String,
    /// Parent field holding the join key.
    pub parent_field: String,
    /// Type of the parent join key.
    pub parent_type: ScalarType,
    /// Table holding the links.
    pub table: String,
    /// Link column matched against the parent join key.
    pub parent_key: String,
    /// Link column identifying the related record.
    pub target_key: String,
    /// Output key of each related object.
    pub target_pk: String,
    /// Type of the related key.
    pub target_type: ScalarType,
}

impl DeferredLink {
    fn new(parent_path: Vec<String>, parent: &TableDef, relation: &RelationDef, target: &TableDef) -> Self {
        let link = relation.link(target);
        Self {
            parent_path,
            name: relation.name.clone(),
            parent_field: relation.join_key.clone(),
            parent_type: parent
                .column(&relation.join_key)
                .map(|c| c.scalar_type)
                .unwrap_or_else(|| parent.primary_type()),
            table: link.table.to_string(),
            parent_key: link.parent_key.to_string(),
            target_key: link.target_key.to_string(),
            target_pk: target.primary_key.clone(),
            target_type: target.primary_type(),
        }
    }

    /// Dotted path of the relation from the root.
    pub fn path(&self) -> String {
        let mut segments = self.parent_path.clone();
        segments.push(self.name.clone());
        segments.join(".")
    }

    /// `(parent key, target key)` pairs for `keys`, ordered by both.
    pub fn statement(&self, keys: Vec<SqlValue>) -> Statement {
        let parent = column_ref("l", &self.parent_key);
        let target = column_ref("l", &self.target_key);
        let placeholders = vec!["?"; keys.len()].join(", ");
        Statement {
            sql: format!(
                "SELECT {parent}, {target} FROM {} AS {} WHERE {parent} IN ({placeholders}) \
                 ORDER BY {parent} ASC, {target} ASC",
                quote_ident(&self.table),
                quote_ident("l")
            ),
            params: keys,
        }
    }
}

/// Select list plus the shape that reassembles its rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    /// Columns in select order.
    pub columns: Vec<SelectColumn>,
    /// Root object shape.
    pub shape: ObjectShape,
    /// Wildcard to-many relations loaded after the rows.
    pub deferred: Vec<DeferredLink>,
}

struct ProjectionBuilder {
    columns: Vec<SelectColumn>,
    slots: HashMap<(String, String), usize>,
    shape: ObjectShape,
    deferred: Vec<DeferredLink>,
}

impl ProjectionBuilder {
    fn new(root_alias: &str, root: &TableDef) -> Self {
        let mut builder = Self {
            columns: Vec::new(),
            slots: HashMap::new(),
            shape: ObjectShape::new(&root.primary_key, 0),
            deferred: Vec::new(),
        };
        builder.slot(root_alias, &root.primary_key, root.primary_type());
        builder
    }

    fn slot(&mut self, alias: &str, column: &str, scalar_type: ScalarType) -> usize {
        let key = (alias.to_string(), column.to_string());
        if let Some(&idx) = self.slots.get(&key) {
            return idx;
        }
        let idx = self.columns.len();
        self.columns.push(SelectColumn {
            alias: alias.to_string(),
            column: column.to_string(),
            scalar_type,
        });
        self.slots.insert(key, idx);
        idx
    }

    /// Ensures the nested shapes for `hops` exist and returns the innermost.
    fn node(&mut self, hops: &[Hop<'_>]) -> &mut ObjectShape {
        let mut pending = Vec::with_capacity(hops.len());
        for hop in hops {
            let pk_slot = self.slot(&hop.alias, &hop.target.primary_key, hop.target.primary_type());
            pending.push((hop.relation.name.clone(), hop.relation.is_many(), hop.target.primary_key.clone(), pk_slot));
        }
        let mut shape = &mut self.shape;
        for (name, many, pk_name, pk_slot) in pending {
            let idx = match shape.relations.iter().position(|r| r.name == name) {
                Some(idx) => idx,
                None => {
                    shape.relations.push(RelationShape {
                        name,
                        many,
                        shape: ObjectShape::new(&pk_name, pk_slot),
                    });
                    shape.relations.len() - 1
                }
            };
            shape = &mut shape.relations[idx].shape;
        }
        shape
    }

    fn field(&mut self, hops: &[Hop<'_>], alias: &str, name: &str, scalar_type: ScalarType) {
        self.node(hops);
        let slot = self.slot(alias, name, scalar_type);
        self.node(hops).add_field(name, slot);
    }

    /// True when the joined shape already holds `parent_path.name`.
    fn is_joined(&self, parent_path: &[String], name: &str) -> bool {
        let mut shape = &self.shape;
        for segment in parent_path {
            match shape.relations.iter().find(|r| &r.name == segment) {
                Some(relation) => shape = &relation.shape,
                None => return false,
            }
        }
        shape.relations.iter().any(|r| r.name == name)
    }

    /// Drops deferred links that a named field joined after all, and repeats.
    fn finish(mut self) -> Projection {
        let pending = std::mem::take(&mut self.deferred);
        let mut deferred: Vec<DeferredLink> = Vec::with_capacity(pending.len());
        for link in pending {
            let duplicate = deferred
                .iter()
                .any(|d| d.parent_path == link.parent_path && d.name == link.name);
            if !duplicate && !self.is_joined(&link.parent_path, &link.name) {
                deferred.push(link);
            }
        }
        Projection {
            columns: self.columns,
            shape: self.shape,
            deferred,
        }
    }
}

/// Resolves `fields` into a select list and hydration shape.
pub(crate) fn resolve_projection(
    ctx: &mut QueryContext<'_>,
    fields: &[FieldPath],
) -> Result<Projection, CompileError> {
    let root_alias = ctx.root_alias();
    let root = ctx.root;
    let mut builder = ProjectionBuilder::new(&root_alias, root);
    let wildcard_root = [FieldPath::parse("*")];
    let fields = if fields.is_empty() { &wildcard_root[..] } else { fields };

    for path in fields {
        if path.is_wildcard() {
            let prefix = path.parent();
            if prefix.is_empty() {
                wildcard(ctx, &mut builder, &[], &root_alias, "", root);
                continue;
            }
            match ctx.resolve(&prefix, JoinUsage::PROJECTION) {
                Some(resolved @ Resolved::Relation { .. }) => {
                    let Some(hop) = ctx.join_relation(&resolved, JoinUsage::PROJECTION) else {
                        continue;
                    };
                    let mut hops = hops_of(&resolved);
                    hops.push(hop.clone());
                    wildcard(ctx, &mut builder, &hops, &hop.alias, &hop.path, hop.target);
                }
                _ => ctx.unresolved(path, "field")?,
            }
            continue;
        }
        match ctx.resolve(path, JoinUsage::PROJECTION) {
            Some(Resolved::Column { hops, alias, column }) => {
                builder.field(&hops, &alias, &column.name, column.scalar_type);
            }
            Some(resolved @ Resolved::Relation { .. }) => {
                let Some(hop) = ctx.join_relation(&resolved, JoinUsage::PROJECTION) else {
                    continue;
                };
                let mut hops = hops_of(&resolved);
                hops.push(hop);
                builder.node(&hops);
            }
            None => ctx.unresolved(path, "field")?,
        }
    }

    Ok(builder.finish())
}

fn hops_of<'c>(resolved: &Resolved<'c>) -> Vec<Hop<'c>> {
    match resolved {
        Resolved::Column { hops, .. } | Resolved::Relation { hops, .. } => hops.clone(),
    }
}

fn wildcard<'c>(
    ctx: &mut QueryContext<'c>,
    builder: &mut ProjectionBuilder,
    hops: &[Hop<'c>],
    alias: &str,
    path: &str,
    table: &'c TableDef,
) {
    for column in &table.columns {
        builder.field(hops, alias, &column.name, column.scalar_type);
    }
    builder.node(hops);
    for relation in &table.relations {
        let Some(target) = ctx.catalog.target_of(relation) else {
            continue;
        };
        if relation.is_many() {
            let parent_path = hops.iter().map(|hop| hop.relation.name.clone()).collect();
            builder
                .deferred
                .push(DeferredLink::new(parent_path, table, relation, target));
            continue;
        }
        let rel_alias = ctx
            .aliases
            .join(path, alias, relation, target, JoinUsage::PROJECTION);
        let mut nested = hops.to_vec();
        nested.push(Hop {
            path: if path.is_empty() {
                relation.name.clone()
            } else {
                format!("{path}.{}", relation.name)
            },
            alias: rel_alias,
            relation,
            target,
        });
        builder.node(&nested);
    }
}

impl Projection {
    /// Rebuilds nested records from flat rows, in first-seen root order.
    pub fn hydrate(&self, rows: &[Vec<SqlValue>]) -> Vec<Json> {
        let mut roots: Vec<Partial> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let Some(pk) = row.get(self.shape.pk_slot) else {
                continue;
            };
            let key = pk.identity();
            let idx = *index.entry(key).or_insert_with(|| {
                roots.push(Partial::default());
                roots.len() - 1
            });
            roots[idx].merge(row, &self.shape, &self.columns);
        }
        roots
            .into_iter()
            .map(|partial| Json::Object(partial.finish(&self.shape, &self.columns)))
            .collect()
    }

    /// Replaces relation objects that carry only their primary key with the
    /// bare key, one level deep.
    pub fn collapse(&self, record: &mut Json) {
        let Json::Object(map) = record else {
            return;
        };
        let joined = self
            .shape
            .relations
            .iter()
            .map(|r| (r.name.as_str(), r.shape.pk_name.as_str()));
        let deferred = self
            .deferred
            .iter()
            .filter(|d| d.parent_path.is_empty())
            .map(|d| (d.name.as_str(), d.target_pk.as_str()));
        for (name, pk) in joined.chain(deferred) {
            match map.get_mut(name) {
                Some(Json::Array(items)) => {
                    for item in items.iter_mut() {
                        collapse_singleton(item, pk);
                    }
                }
                Some(value) => collapse_singleton(value, pk),
                None => {}
            }
        }
    }
}

fn collapse_singleton(value: &mut Json, pk: &str) {
    let replacement = match value {
        Json::Object(obj) if obj.len() == 1 => obj.get(pk).cloned(),
        _ => None,
    };
    if let Some(id) = replacement {
        *value = id;
    }
}

#[derive(Default)]
struct Partial {
    cells: Option<Vec<SqlValue>>,
    children: HashMap<String, ChildSet>,
}

#[derive(Default)]
struct ChildSet {
    order: Vec<Partial>,
    index: HashMap<String, usize>,
}

impl Partial {
    fn merge(&mut self, row: &[SqlValue], shape: &ObjectShape, columns: &[SelectColumn]) {
        if self.cells.is_none() {
            self.cells = Some(
                shape
                    .fields
                    .iter()
                    .map(|f| row.get(f.slot).cloned().unwrap_or(SqlValue::Null))
                    .collect(),
            );
        }
        for relation in &shape.relations {
            let set = self.children.entry(relation.name.clone()).or_default();
            let pk = match row.get(relation.shape.pk_slot) {
                Some(pk) if !pk.is_null() => pk,
                _ => continue,
            };
            let key = pk.identity();
            let idx = match set.index.get(&key) {
                Some(&idx) => idx,
                None => {
                    set.order.push(Partial::default());
                    set.index.insert(key, set.order.len() - 1);
                    set.order.len() - 1
                }
            };
            set.order[idx].merge(row, &relation.shape, columns);
        }
    }

    fn finish(mut self, shape: &ObjectShape, columns: &[SelectColumn]) -> Map<String, Json> {
        let mut out = Map::new();
        let cells = self.cells.take().unwrap_or_default();
        for (field, cell) in shape.fields.iter().zip(cells) {
            let ty = columns.get(field.slot).map(|c| c.scalar_type);
            out.insert(field.name.clone(), cell.to_json(ty));
        }
        for relation in &shape.relations {
            let set = self.children.remove(&relation.name).unwrap_or_default();
            let mut objects = set
                .order
                .into_iter()
                .map(|child| Json::Object(child.finish(&relation.shape, columns)));
            let value = if relation.many {
                Json::Array(objects.collect())
            } else {
                objects.next().unwrap_or(Json::Null)
            };
            out.insert(relation.name.clone(), value);
        }
        out
    }
}
