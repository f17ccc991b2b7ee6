//! Per-table CRUD façade over the query compiler and the relational store.
//!
//! Reads go through [`compile_find`] and [`execute_find`]. Writes accept JSON
//! payloads keyed by column or relation name, run inside one store
//! transaction, pass the system-record protection checks first, and signal
//! the injected [`CacheService`] once committed.

mod cache;
mod protection;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::{info, warn};

use crate::catalog::{CatalogSource, RelationDef, ScalarType, SchemaCatalog, TableDef};
use crate::query::sql::{quote_ident, Statement};
use crate::query::{
    compile_find, execute_find, CompileError, CompileOptions, FindPlan, FindRequest, FindResult,
    PathPolicy, SqlValue,
};
use crate::store::{RelationalStore, StoreSession};
use crate::{Error, Result};

pub use cache::{CacheService, ScopedCache};
pub use protection::ProtectionViolation;

use protection::{check_create, check_links, check_update, is_system, same_value};

type Row = Vec<(String, SqlValue)>;

/// A to-one relation whose foreign key lives on the record itself.
struct ForeignKey<'c> {
    relation: &'c RelationDef,
    target: &'c TableDef,
    value: SqlValue,
}

/// A relation rewritten through a junction table or the target's foreign key.
struct LinkSet<'c> {
    relation: &'c RelationDef,
    target: &'c TableDef,
    ids: Vec<SqlValue>,
}

#[derive(Default)]
struct Changes<'c> {
    columns: Row,
    foreign_keys: Vec<ForeignKey<'c>>,
    links: Vec<LinkSet<'c>>,
}

/// CRUD for one table.
#[derive(Clone)]
pub struct DynamicRepository {
    table: String,
    catalog: Arc<dyn CatalogSource>,
    store: Arc<dyn RelationalStore>,
    cache: Option<Arc<dyn CacheService>>,
    options: CompileOptions,
}

impl DynamicRepository {
    /// Repository for `table`; the table is looked up on every call against
    /// the catalog's current snapshot.
    pub fn new(
        table: impl Into<String>,
        catalog: Arc<dyn CatalogSource>,
        store: Arc<dyn RelationalStore>,
    ) -> Self {
        Self {
            table: table.into(),
            catalog,
            store,
            cache: None,
            options: CompileOptions::default(),
        }
    }

    /// Cache to invalidate after mutations.
    pub fn with_cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Compile options for reads and payload validation.
    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Compiles without executing.
    pub fn explain(&self, request: &FindRequest) -> Result<FindPlan> {
        let catalog = self.catalog.snapshot();
        Ok(compile_find(&catalog, &self.table, request, &self.options)?)
    }

    /// Runs a find.
    pub fn find(&self, request: &FindRequest) -> Result<FindResult> {
        let plan = self.explain(request)?;
        execute_find(&self.store, &plan)
    }

    /// Loads one record by primary key with every scalar and relation key.
    pub fn find_one(&self, id: &Json) -> Result<Option<Json>> {
        let catalog = self.catalog.snapshot();
        let table = table_def(&catalog, &self.table)?;
        let mut filter = Map::new();
        filter.insert(table.primary_key.clone(), Json::Object(Map::from_iter([(
            "eq".to_string(),
            id.clone(),
        )])));
        let request = FindRequest::new().with_filter(Json::Object(filter)).with_limit(1);
        let plan = compile_find(&catalog, &self.table, &request, &self.options)?;
        Ok(execute_find(&self.store, &plan)?.data.into_iter().next())
    }

    /// Inserts a record and returns it as [`DynamicRepository::find_one`] would.
    pub fn create(&self, payload: &Json) -> Result<Json> {
        let catalog = self.catalog.snapshot();
        let table = table_def(&catalog, &self.table)?;
        let changes = self.split_payload(&catalog, table, payload, true)?;
        check_create(table, &changes.columns)?;
        let explicit_key = changes
            .columns
            .iter()
            .any(|(name, value)| *name == table.primary_key && !value.is_null());
        if !explicit_key && table.primary_type() != ScalarType::Int {
            return Err(Error::InvalidArgument(format!(
                "'{}' records need an explicit '{}'",
                table.name, table.primary_key
            )));
        }

        let mut created: Option<SqlValue> = None;
        self.store.transaction(&mut |session| {
            for fk in &changes.foreign_keys {
                let key = &fk.relation.inverse_join_key;
                check_links(session, fk.target, key, &fk.relation.name, "attach", &non_null(&fk.value))?;
            }
            let mut columns = changes.columns.clone();
            for fk in &changes.foreign_keys {
                columns.push((fk.relation.join_key.clone(), fk.value.clone()));
            }
            let outcome = session.execute(&insert_statement(table, &columns))?;
            let id = match columns
                .iter()
                .find(|(name, value)| *name == table.primary_key && !value.is_null())
            {
                Some((_, id)) => id.clone(),
                None => outcome
                    .last_insert_id
                    .map(SqlValue::Int)
                    .ok_or_else(|| Error::InvalidArgument("insert produced no key".into()))?,
            };
            if !changes.links.is_empty() {
                let stored = load_row(session, table, &id)?
                    .ok_or_else(|| Error::not_found(&table.name, id_text(&id)))?;
                for link in &changes.links {
                    let parent = cell(&stored, &link.relation.join_key);
                    apply_links(session, table, &stored, link, &parent)?;
                }
            }
            created = Some(id);
            Ok(())
        })?;

        let id = created.ok_or_else(|| Error::InvalidArgument("insert produced no key".into()))?;
        info!(table = %table.name, id = %id_text(&id), "record created");
        self.invalidate(table);
        let id = id.to_json(Some(table.primary_type()));
        self.find_one(&id)?
            .ok_or_else(|| Error::not_found(&table.name, id.to_string()))
    }

    /// Applies `payload` to the record with primary key `id`.
    pub fn update(&self, id: &Json, payload: &Json) -> Result<Json> {
        let catalog = self.catalog.snapshot();
        let table = table_def(&catalog, &self.table)?;
        let changes = self.split_payload(&catalog, table, payload, false)?;
        let key = SqlValue::coerce(id, table.primary_type());

        self.store.transaction(&mut |session| {
            let stored = load_row(session, table, &key)?
                .ok_or_else(|| Error::not_found(&table.name, id_text(&key)))?;
            let mut columns = changes.columns.clone();
            for fk in &changes.foreign_keys {
                columns.push((fk.relation.join_key.clone(), fk.value.clone()));
            }
            check_update(table, &id_text(&key), &stored, &columns)?;

            for fk in &changes.foreign_keys {
                let old = cell(&stored, &fk.relation.join_key);
                let ty = fk.target.primary_type();
                if same_value(&old, &fk.value, ty) {
                    continue;
                }
                let inverse = &fk.relation.inverse_join_key;
                let name = &fk.relation.name;
                check_links(session, fk.target, inverse, name, "detach", &non_null(&old))?;
                check_links(session, fk.target, inverse, name, "attach", &non_null(&fk.value))?;
            }
            for link in &changes.links {
                let parent = cell(&stored, &link.relation.join_key);
                apply_links(session, table, &stored, link, &parent)?;
            }
            if !columns.is_empty() {
                session.execute(&update_statement(table, &columns, &key))?;
            }
            Ok(())
        })?;

        info!(table = %table.name, id = %id_text(&key), "record updated");
        self.invalidate(table);
        self.find_one(id)?
            .ok_or_else(|| Error::not_found(&table.name, id_text(&key)))
    }

    /// Deletes the record with primary key `id`.
    pub fn delete(&self, id: &Json) -> Result<()> {
        let catalog = self.catalog.snapshot();
        let table = table_def(&catalog, &self.table)?;
        let key = SqlValue::coerce(id, table.primary_type());

        self.store.transaction(&mut |session| {
            let stored = load_row(session, table, &key)?
                .ok_or_else(|| Error::not_found(&table.name, id_text(&key)))?;
            if is_system(table, &stored) {
                return Err(ProtectionViolation::Delete {
                    table: table.name.clone(),
                    id: id_text(&key),
                }
                .into());
            }
            for relation in &table.relations {
                let Some(junction) = &relation.junction else {
                    continue;
                };
                session.execute(&Statement {
                    sql: format!(
                        "DELETE FROM {} WHERE {} = ?",
                        quote_ident(&junction.table),
                        quote_ident(&junction.source_key)
                    ),
                    params: vec![cell(&stored, &relation.join_key)],
                })?;
            }
            session.execute(&Statement {
                sql: format!(
                    "DELETE FROM {} WHERE {} = ?",
                    quote_ident(&table.name),
                    quote_ident(&table.primary_key)
                ),
                params: vec![key.clone()],
            })?;
            Ok(())
        })?;

        info!(table = %table.name, id = %id_text(&key), "record deleted");
        self.invalidate(table);
        Ok(())
    }

    fn invalidate(&self, table: &TableDef) {
        if let (Some(cache), Some(scope)) = (&self.cache, &table.cache_scope) {
            cache.invalidate(scope);
            info!(table = %table.name, scope = %scope, "cache invalidated");
        }
    }

    fn split_payload<'c>(
        &self,
        catalog: &'c SchemaCatalog,
        table: &'c TableDef,
        payload: &Json,
        creating: bool,
    ) -> Result<Changes<'c>> {
        let Json::Object(fields) = payload else {
            return Err(Error::InvalidArgument("payload must be an object".into()));
        };
        let mut changes = Changes::default();
        for (key, value) in fields {
            if let Some(column) = table.column(key) {
                if !creating && *key == table.primary_key {
                    continue;
                }
                changes
                    .columns
                    .push((column.name.clone(), SqlValue::coerce(value, column.scalar_type)));
                continue;
            }
            let Some(relation) = table.relation(key) else {
                match self.options.path_policy {
                    PathPolicy::Strict => {
                        return Err(Error::InvalidArgument(format!(
                            "'{}' has no field '{key}'",
                            table.name
                        )))
                    }
                    PathPolicy::Lenient => {
                        warn!(table = %table.name, field = %key, "ignoring unknown payload field");
                        continue;
                    }
                }
            };
            let target = catalog.target_of(relation).ok_or_else(|| CompileError::UnknownTable {
                table: relation.target_table.clone(),
            })?;
            if relation.is_owning(table) {
                changes.foreign_keys.push(ForeignKey {
                    relation,
                    target,
                    value: related_id(key, value, target)?,
                });
            } else {
                changes.links.push(LinkSet {
                    relation,
                    target,
                    ids: related_ids(key, value, target)?,
                });
            }
        }
        Ok(changes)
    }
}

fn table_def<'c>(catalog: &'c SchemaCatalog, name: &str) -> Result<&'c TableDef> {
    catalog.table(name).ok_or_else(|| {
        Error::Compile(CompileError::UnknownTable {
            table: name.to_string(),
        })
    })
}

fn related_id(field: &str, value: &Json, target: &TableDef) -> Result<SqlValue> {
    match value {
        Json::Object(obj) => match obj.get(&target.primary_key) {
            Some(id) => Ok(SqlValue::coerce(id, target.primary_type())),
            None => Err(Error::InvalidArgument(format!(
                "'{field}' object needs '{}'",
                target.primary_key
            ))),
        },
        Json::Array(_) => Err(Error::InvalidArgument(format!(
            "'{field}' expects a single related id"
        ))),
        scalar => Ok(SqlValue::coerce(scalar, target.primary_type())),
    }
}

fn related_ids(field: &str, value: &Json, target: &TableDef) -> Result<Vec<SqlValue>> {
    let items = match value {
        Json::Array(items) => items.iter().collect(),
        Json::Null => Vec::new(),
        single => vec![single],
    };
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let id = related_id(field, item, target)?;
        if !id.is_null() && seen.insert(id.identity()) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn non_null(value: &SqlValue) -> Vec<SqlValue> {
    if value.is_null() {
        Vec::new()
    } else {
        vec![value.clone()]
    }
}

fn cell(row: &[(String, SqlValue)], column: &str) -> SqlValue {
    row.iter()
        .find(|(name, _)| name == column)
        .map(|(_, value)| value.clone())
        .unwrap_or(SqlValue::Null)
}

fn id_text(id: &SqlValue) -> String {
    match id {
        SqlValue::Text(s) => s.clone(),
        other => other.to_json(None).to_string(),
    }
}

fn load_row(session: &dyn StoreSession, table: &TableDef, key: &SqlValue) -> Result<Option<Row>> {
    let rows = session.query(&Statement {
        sql: format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(&table.name),
            quote_ident(&table.primary_key)
        ),
        params: vec![key.clone()],
    })?;
    Ok(rows
        .rows
        .into_iter()
        .next()
        .map(|cells| rows.columns.iter().cloned().zip(cells).collect()))
}

fn insert_statement(table: &TableDef, columns: &[(String, SqlValue)]) -> Statement {
    if columns.is_empty() {
        return Statement {
            sql: format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&table.name)),
            params: Vec::new(),
        };
    }
    let names = columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    Statement {
        sql: format!(
            "INSERT INTO {} ({names}) VALUES ({placeholders})",
            quote_ident(&table.name)
        ),
        params: columns.iter().map(|(_, value)| value.clone()).collect(),
    }
}

fn update_statement(table: &TableDef, columns: &[(String, SqlValue)], key: &SqlValue) -> Statement {
    let assignments = columns
        .iter()
        .map(|(name, _)| format!("{} = ?", quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut params: Vec<SqlValue> = columns.iter().map(|(_, value)| value.clone()).collect();
    params.push(key.clone());
    Statement {
        sql: format!(
            "UPDATE {} SET {assignments} WHERE {} = ?",
            quote_ident(&table.name),
            quote_ident(&table.primary_key)
        ),
        params,
    }
}

/// Column on the link side that identifies related records, and the table
/// holding it.
fn link_columns<'c>(link: &LinkSet<'c>) -> (&'c str, &'c str, &'c str) {
    match &link.relation.junction {
        Some(junction) => (&junction.table, &junction.source_key, &junction.target_key),
        None => (
            &link.target.name,
            &link.relation.inverse_join_key,
            &link.target.primary_key,
        ),
    }
}

fn current_links(session: &dyn StoreSession, link: &LinkSet<'_>, parent: &SqlValue) -> Result<Vec<SqlValue>> {
    let (table, parent_key, target_key) = link_columns(link);
    let rows = session.query(&Statement {
        sql: format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(target_key),
            quote_ident(table),
            quote_ident(parent_key)
        ),
        params: vec![parent.clone()],
    })?;
    Ok(rows
        .rows
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter(|id| !id.is_null())
        .collect())
}

/// Rewrites one relation to exactly `link.ids`, checking protection on the
/// parent and on every attached or detached record first.
fn apply_links(
    session: &dyn StoreSession,
    table: &TableDef,
    stored: &[(String, SqlValue)],
    link: &LinkSet<'_>,
    parent: &SqlValue,
) -> Result<()> {
    if parent.is_null() {
        return Err(Error::InvalidArgument(format!(
            "'{}' cannot link records without a '{}' value",
            table.name, link.relation.join_key
        )));
    }
    let current = current_links(session, link, parent)?;
    let current_keys: HashSet<String> = current.iter().map(SqlValue::identity).collect();
    let wanted_keys: HashSet<String> = link.ids.iter().map(SqlValue::identity).collect();
    let attached: Vec<SqlValue> = link
        .ids
        .iter()
        .filter(|id| !current_keys.contains(&id.identity()))
        .cloned()
        .collect();
    let detached: Vec<SqlValue> = current
        .into_iter()
        .filter(|id| !wanted_keys.contains(&id.identity()))
        .collect();
    if attached.is_empty() && detached.is_empty() {
        return Ok(());
    }

    let name = &link.relation.name;
    if is_system(table, stored) && !table.is_exempt(name) {
        return Err(ProtectionViolation::Field {
            table: table.name.clone(),
            id: id_text(&cell(stored, &table.primary_key)),
            field: name.clone(),
        }
        .into());
    }
    let key = match link.relation.junction {
        Some(_) => &link.relation.inverse_join_key,
        None => &link.target.primary_key,
    };
    check_links(session, link.target, key, name, "detach", &detached)?;
    check_links(session, link.target, key, name, "attach", &attached)?;

    let (link_table, parent_key, target_key) = link_columns(link);
    let in_list = |n: usize| vec!["?"; n].join(", ");
    match link.relation.junction {
        Some(_) => {
            if !detached.is_empty() {
                let mut params = vec![parent.clone()];
                params.extend(detached.iter().cloned());
                session.execute(&Statement {
                    sql: format!(
                        "DELETE FROM {} WHERE {} = ? AND {} IN ({})",
                        quote_ident(link_table),
                        quote_ident(parent_key),
                        quote_ident(target_key),
                        in_list(detached.len())
                    ),
                    params,
                })?;
            }
            for id in &attached {
                session.execute(&Statement {
                    sql: format!(
                        "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                        quote_ident(link_table),
                        quote_ident(parent_key),
                        quote_ident(target_key)
                    ),
                    params: vec![parent.clone(), id.clone()],
                })?;
            }
        }
        None => {
            if !detached.is_empty() {
                session.execute(&Statement {
                    sql: format!(
                        "UPDATE {} SET {} = NULL WHERE {} IN ({})",
                        quote_ident(link_table),
                        quote_ident(parent_key),
                        quote_ident(target_key),
                        in_list(detached.len())
                    ),
                    params: detached.clone(),
                })?;
            }
            if !attached.is_empty() {
                let mut params = vec![parent.clone()];
                params.extend(attached.iter().cloned());
                session.execute(&Statement {
                    sql: format!(
                        "UPDATE {} SET {} = ? WHERE {} IN ({})",
                        quote_ident(link_table),
                        quote_ident(parent_key),
                        quote_ident(target_key),
                        in_list(attached.len())
                    ),
                    params,
                })?;
            }
        }
    }
    Ok(())
}

/// Hands out repositories that share one store, catalog source, cache, and
/// set of compile options.
#[derive(Clone)]
pub struct RepositoryRegistry {
    catalog: Arc<dyn CatalogSource>,
    store: Arc<dyn RelationalStore>,
    cache: Option<Arc<dyn CacheService>>,
    options: CompileOptions,
}

impl RepositoryRegistry {
    /// Registry over `catalog` and `store`.
    pub fn new(catalog: Arc<dyn CatalogSource>, store: Arc<dyn RelationalStore>) -> Self {
        Self {
            catalog,
            store,
            cache: None,
            options: CompileOptions::default(),
        }
    }

    /// Cache shared by every repository.
    pub fn with_cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Compile options shared by every repository.
    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<SchemaCatalog> {
        self.catalog.snapshot()
    }

    /// Repository for `table`, failing if the current snapshot lacks it.
    pub fn repository(&self, table: &str) -> Result<DynamicRepository> {
        table_def(&self.catalog.snapshot(), table)?;
        let mut repo = DynamicRepository::new(table, Arc::clone(&self.catalog), Arc::clone(&self.store))
            .with_options(self.options.clone());
        if let Some(cache) = &self.cache {
            repo = repo.with_cache(Arc::clone(cache));
        }
        Ok(repo)
    }
}
