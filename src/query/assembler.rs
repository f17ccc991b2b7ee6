//! Runs a [`FindPlan`] against a store session and shapes the response
//! envelope.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::store::StoreSession;
use crate::Result;

use super::ast::AggFn;
use super::plan::{AggregatePlan, FindPlan};
use super::projection::{DeferredLink, Projection};
use super::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use super::sql::Statement;
use super::value::SqlValue;

/// Optional response metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindMeta {
    /// Rows in the table, ignoring the filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// Records matching the filter, ignoring pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_count: Option<u64>,
    /// `{fn: {label: value}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Map<String, Json>>,
}

/// `{data, meta?}` response envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FindResult {
    /// Hydrated records in sort order.
    pub data: Vec<Json>,
    /// Present when counts or aggregates were requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<FindMeta>,
}

/// Executes every statement of `plan` and assembles the result.
pub fn execute_find(session: &dyn StoreSession, plan: &FindPlan) -> Result<FindResult> {
    let timer = profile_timer();
    let rows = session.query(&plan.data)?;
    record_profile_timer(QueryProfileKind::Execute, timer);

    let timer = profile_timer();
    let mut data = plan.projection.hydrate(&rows.rows);
    load_deferred(session, &plan.projection, &mut data)?;
    for record in &mut data {
        plan.projection.collapse(record);
    }
    record_profile_timer(QueryProfileKind::Hydrate, timer);

    let timer = profile_timer();
    let mut meta = FindMeta::default();
    let mut has_meta = false;
    if let Some(stmt) = &plan.total_count {
        meta.total_count = Some(count(session, stmt)?);
        has_meta = true;
    }
    if let Some(stmt) = &plan.filter_count {
        meta.filter_count = Some(count(session, stmt)?);
        has_meta = true;
    }
    if let Some(aggregate) = &plan.aggregate {
        meta.aggregate = Some(aggregates(session, aggregate)?);
        has_meta = true;
    }
    if has_meta {
        record_profile_timer(QueryProfileKind::Count, timer);
    }

    debug!(
        table = %plan.table,
        fingerprint = %plan.data.fingerprint_hex(),
        rows = rows.rows.len(),
        records = data.len(),
        "find executed"
    );
    Ok(FindResult {
        data,
        meta: has_meta.then_some(meta),
    })
}

/// Keys bound per deferred link query.
const DEFERRED_CHUNK: usize = 500;

fn load_deferred(session: &dyn StoreSession, projection: &Projection, data: &mut [Json]) -> Result<()> {
    for link in &projection.deferred {
        let mut parents = Vec::new();
        for record in data.iter_mut() {
            parents_at(record, &link.parent_path, &mut parents);
        }
        let mut seen = HashSet::new();
        let keys: Vec<SqlValue> = parents
            .iter()
            .map(|parent| parent_key(link, parent))
            .filter(|key| !key.is_null() && seen.insert(key.identity()))
            .collect();

        let mut related: HashMap<String, Vec<Json>> = HashMap::new();
        for chunk in keys.chunks(DEFERRED_CHUNK) {
            let rows = session.query(&link.statement(chunk.to_vec()))?;
            for row in rows.rows {
                let (Some(parent), Some(target)) = (row.first(), row.get(1)) else {
                    continue;
                };
                if target.is_null() {
                    continue;
                }
                let mut object = Map::new();
                object.insert(link.target_pk.clone(), target.to_json(Some(link.target_type)));
                related
                    .entry(parent.identity())
                    .or_default()
                    .push(Json::Object(object));
            }
        }
        debug!(relation = %link.path(), parents = keys.len(), "loaded deferred links");

        for parent in parents {
            let key = parent_key(link, parent);
            let items = related.get(&key.identity()).cloned().unwrap_or_default();
            parent.insert(link.name.clone(), Json::Array(items));
        }
    }
    Ok(())
}

fn parent_key(link: &DeferredLink, parent: &Map<String, Json>) -> SqlValue {
    parent
        .get(&link.parent_field)
        .map(|value| SqlValue::coerce(value, link.parent_type))
        .unwrap_or(SqlValue::Null)
}

/// Collects the objects reached by following `path` from `value`, through
/// arrays and nested objects.
fn parents_at<'a>(value: &'a mut Json, path: &[String], out: &mut Vec<&'a mut Map<String, Json>>) {
    match value {
        Json::Array(items) => {
            for item in items {
                parents_at(item, path, out);
            }
        }
        Json::Object(map) => match path.split_first() {
            None => out.push(map),
            Some((head, rest)) => {
                if let Some(child) = map.get_mut(head) {
                    parents_at(child, rest, out);
                }
            }
        },
        _ => {}
    }
}

fn count(session: &dyn StoreSession, statement: &Statement) -> Result<u64> {
    let rows = session.query(statement)?;
    Ok(match rows.scalar() {
        Some(SqlValue::Int(n)) => u64::try_from(*n).unwrap_or(0),
        Some(SqlValue::Float(f)) => *f as u64,
        _ => 0,
    })
}

fn aggregates(session: &dyn StoreSession, plan: &AggregatePlan) -> Result<Map<String, Json>> {
    let rows = session.query(&plan.statement)?;
    let cells = rows.rows.into_iter().next().unwrap_or_default();
    let mut out = Map::new();
    for (idx, output) in plan.outputs.iter().enumerate() {
        let value = match (cells.get(idx), output.function) {
            (None | Some(SqlValue::Null), AggFn::Count) => Json::from(0),
            (Some(cell), _) => cell.to_json(None),
            (None, _) => Json::Null,
        };
        let entry = out
            .entry(output.function.name().to_string())
            .or_insert_with(|| Json::Object(Map::new()));
        if let Json::Object(by_label) = entry {
            by_label.insert(output.label.clone(), value);
        }
    }
    Ok(out)
}
