//! Find planning: compiles a [`FindRequest`] into the data statement plus the
//! optional count and aggregate statements.
//!
//! Consumers are compiled in a fixed order (projection, filter, sort,
//! aggregate) so alias numbering is deterministic for a given request.
//! When the row statement joins a to-many relation and a row cap applies, the
//! page is selected over distinct root keys in a window subquery, so `limit`
//! counts records rather than joined rows.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::catalog::SchemaCatalog;

use super::aggregate::{resolve_aggregates, AggregateDescriptor};
use super::alias::JoinUsage;
use super::ast::{parse_aggregates, parse_fields, parse_sort, AggFn, MetaMode};
use super::context::{CompileOptions, QueryContext};
use super::errors::CompileError;
use super::filter::compile_filter;
use super::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use super::projection::{resolve_projection, Projection};
use super::sort::{compile_sort, SortKey};
use super::sql::{column_ref, quote_ident, SqlFragment, Statement};

/// Declarative find request, as received from the transport layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FindRequest {
    /// Filter document.
    pub filter: Json,
    /// Field selection; a comma list or an array of comma lists.
    #[serde(deserialize_with = "string_list")]
    pub fields: Vec<String>,
    /// Sort terms; a comma list or an array of comma lists.
    #[serde(deserialize_with = "string_list")]
    pub sort: Vec<String>,
    /// 1-based page number.
    pub page: Option<u64>,
    /// Page size; `0` disables the cap.
    pub limit: Option<u64>,
    /// `totalCount`, `filterCount`, or `*`.
    pub meta: Option<String>,
    /// Aggregate document.
    pub aggregate: Json,
}

impl FindRequest {
    /// Empty request: every record, default page size, root wildcard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter document.
    pub fn with_filter(mut self, filter: Json) -> Self {
        self.filter = filter;
        self
    }

    /// Appends a field list.
    pub fn with_fields(mut self, fields: impl Into<String>) -> Self {
        self.fields.push(fields.into());
        self
    }

    /// Appends a sort list.
    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort.push(sort.into());
        self
    }

    /// Sets the page number.
    pub fn with_page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the metadata mode.
    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    /// Sets the aggregate document.
    pub fn with_aggregate(mut self, aggregate: Json) -> Self {
        self.aggregate = aggregate;
        self
    }
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// Resolved pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Window {
    /// Row cap; `None` when unbounded.
    pub limit: Option<u64>,
    /// Records skipped.
    pub skip: u64,
}

impl Window {
    /// `skip = (page - 1) * limit`; page 0 is treated as page 1 and a zero
    /// limit disables the cap.
    pub fn new(page: Option<u64>, limit: Option<u64>, default_limit: u64) -> Self {
        let limit = limit.unwrap_or(default_limit);
        if limit == 0 {
            return Window {
                limit: None,
                skip: 0,
            };
        }
        let page = page.unwrap_or(1).max(1);
        Window {
            limit: Some(limit),
            skip: (page - 1).saturating_mul(limit),
        }
    }

    fn clause(&self) -> String {
        match self.limit {
            Some(limit) => format!(" LIMIT {limit} OFFSET {}", self.skip),
            None => String::new(),
        }
    }
}

/// One output of the aggregate statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregateOutput {
    /// Function, the first key under `meta.aggregate`.
    #[serde(serialize_with = "agg_name")]
    pub function: AggFn,
    /// Second key under `meta.aggregate`.
    pub label: String,
}

fn agg_name<S: serde::Serializer>(function: &AggFn, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(function.name())
}

/// Aggregate statement with its column-to-output mapping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregatePlan {
    /// Single-row statement; column `i` holds `outputs[i]`.
    pub statement: Statement,
    /// Outputs in select order.
    pub outputs: Vec<AggregateOutput>,
}

/// Everything needed to answer one find.
#[derive(Clone, Debug, PartialEq)]
pub struct FindPlan {
    /// Root table.
    pub table: String,
    /// Select list and hydration shape.
    pub projection: Projection,
    /// Row statement.
    pub data: Statement,
    /// Pagination applied to `data`.
    pub window: Window,
    /// Unfiltered count, when requested.
    pub total_count: Option<Statement>,
    /// Filtered count before pagination, when requested.
    pub filter_count: Option<Statement>,
    /// Aggregates, when requested.
    pub aggregate: Option<AggregatePlan>,
    /// Paths dropped under the lenient policy.
    pub skipped: Vec<String>,
}

impl FindPlan {
    /// Labeled statements in execution order.
    pub fn statements(&self) -> Vec<(&'static str, &Statement)> {
        let mut out = vec![("data", &self.data)];
        if let Some(stmt) = &self.total_count {
            out.push(("totalCount", stmt));
        }
        if let Some(stmt) = &self.filter_count {
            out.push(("filterCount", stmt));
        }
        if let Some(agg) = &self.aggregate {
            out.push(("aggregate", &agg.statement));
        }
        out
    }
}

/// Compiles `request` against `table`.
pub fn compile_find(
    catalog: &SchemaCatalog,
    table: &str,
    request: &FindRequest,
    options: &CompileOptions,
) -> Result<FindPlan, CompileError> {
    let timer = profile_timer();
    let meta = MetaMode::parse(request.meta.as_deref())?;
    let aggregates = parse_aggregates(&request.aggregate)?;
    let mut ctx = QueryContext::new(catalog, table, options.clone())?;

    let projection = resolve_projection(&mut ctx, &parse_fields(&request.fields))?;
    let filter = compile_filter(&mut ctx, &request.filter, JoinUsage::FILTER)?.where_fragment();
    let sort = compile_sort(&mut ctx, &parse_sort(&request.sort))?;
    let aggregates = resolve_aggregates(&mut ctx, &aggregates)?;

    let window = Window::new(request.page, request.limit, options.default_limit);
    let from = format!(
        "{} AS {}",
        quote_ident(&ctx.root.name),
        quote_ident(&ctx.root_alias())
    );
    let root_pk = column_ref(&ctx.root_alias(), &ctx.root.primary_key);

    let data = data_statement(&ctx, &projection, filter.as_ref(), &sort, window, &from, &root_pk);
    let total_count = meta.total_count.then(|| Statement {
        sql: format!("SELECT COUNT(*) FROM {}", quote_ident(&ctx.root.name)),
        params: Vec::new(),
    });
    let filter_count = meta.filter_count.then(|| {
        let mut stmt = SqlFragment::raw(format!(
            "SELECT COUNT(DISTINCT {root_pk}) FROM {from}{}",
            ctx.aliases.render(JoinUsage::FILTER)
        ));
        push_where(&mut stmt, filter.as_ref());
        Statement::from(stmt)
    });
    let aggregate = (!aggregates.is_empty())
        .then(|| aggregate_plan(&ctx, &aggregates, filter.as_ref(), &from, &root_pk));

    let plan = FindPlan {
        table: ctx.root.name.clone(),
        projection,
        data,
        window,
        total_count,
        filter_count,
        aggregate,
        skipped: std::mem::take(&mut ctx.skipped),
    };
    debug!(
        table = %plan.table,
        fingerprint = %plan.data.fingerprint_hex(),
        joins = ctx.aliases.joins().len(),
        params = plan.data.params.len(),
        "compiled find"
    );
    record_profile_timer(QueryProfileKind::Compile, timer);
    Ok(plan)
}

fn push_where(stmt: &mut SqlFragment, filter: Option<&SqlFragment>) {
    if let Some(filter) = filter {
        stmt.push_str(" WHERE ");
        stmt.push(filter.clone());
    }
}

fn data_statement(
    ctx: &QueryContext<'_>,
    projection: &Projection,
    filter: Option<&SqlFragment>,
    sort: &[SortKey],
    window: Window,
    from: &str,
    root_pk: &str,
) -> Statement {
    let select = projection
        .columns
        .iter()
        .map(|c| c.sql())
        .collect::<Vec<_>>()
        .join(", ");
    // Joined to-many keys keep related rows in a stable order.
    let order = sort
        .iter()
        .map(SortKey::render)
        .chain(
            ctx.aliases
                .joins_for(JoinUsage::ROWS)
                .filter(|j| j.many)
                .map(|j| format!("{} ASC", column_ref(&j.alias, &j.target_pk))),
        )
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = SqlFragment::raw(format!(
        "SELECT {select} FROM {from}{}",
        ctx.aliases.render(JoinUsage::ROWS)
    ));

    let windowed = window.limit.is_some() && ctx.aliases.has_many(JoinUsage::ROWS);
    if !windowed {
        push_where(&mut stmt, filter);
        stmt.push_str(&format!(" ORDER BY {order}{}", window.clause()));
        return stmt.into();
    }

    // Page over distinct root keys, then fetch every joined row of that page.
    let keys = sort
        .iter()
        .enumerate()
        .map(|(idx, key)| format!("{} AS {}", key.expr, quote_ident(&format!("o{idx}"))))
        .collect::<Vec<_>>()
        .join(", ");
    let inner_order = sort
        .iter()
        .enumerate()
        .map(|(idx, key)| key.render_as(&quote_ident(&format!("o{idx}"))))
        .collect::<Vec<_>>()
        .join(", ");
    let mut inner = SqlFragment::raw(format!(
        "SELECT DISTINCT {root_pk} AS {}, {keys} FROM {from}{}",
        quote_ident("k"),
        ctx.aliases.render(JoinUsage::FILTER | JoinUsage::SORT)
    ));
    push_where(&mut inner, filter);
    inner.push_str(&format!(" ORDER BY {inner_order}{}", window.clause()));
    let inner = inner.wrap(
        &format!(
            "{root_pk} IN (SELECT {} FROM (",
            column_ref("w", "k")
        ),
        &format!(") AS {})", quote_ident("w")),
    );

    let predicate = match filter {
        Some(filter) => SqlFragment::join(vec![filter.clone(), inner], " AND "),
        None => inner,
    };
    push_where(&mut stmt, Some(&predicate));
    stmt.push_str(&format!(" ORDER BY {order}"));
    stmt.into()
}

fn aggregate_plan(
    ctx: &QueryContext<'_>,
    aggregates: &[AggregateDescriptor],
    filter: Option<&SqlFragment>,
    from: &str,
    root_pk: &str,
) -> AggregatePlan {
    // The filtered record set as a semi-join, so filter joins never
    // multiply the rows an aggregate sees.
    let records = filter.map(|filter| {
        filter.clone().wrap(
            &format!(
                "{root_pk} IN (SELECT {root_pk} FROM {from}{} WHERE ",
                ctx.aliases.render(JoinUsage::FILTER)
            ),
            ")",
        )
    });
    let columns = aggregates
        .iter()
        .enumerate()
        .map(|(idx, agg)| {
            aggregate_subquery(ctx, agg, records.as_ref(), from, root_pk)
                .wrap("(", &format!(") AS {}", quote_ident(&format!("a{idx}"))))
        })
        .collect();
    AggregatePlan {
        statement: SqlFragment::join(columns, ", ").wrap("SELECT ", "").into(),
        outputs: aggregates
            .iter()
            .map(|agg| AggregateOutput {
                function: agg.function,
                label: agg.label.clone(),
            })
            .collect(),
    }
}

/// One aggregate over its own joins. An aggregate over root rows whose
/// condition crosses a to-many relation tests the condition as a semi-join,
/// so each record contributes once.
fn aggregate_subquery(
    ctx: &QueryContext<'_>,
    agg: &AggregateDescriptor,
    records: Option<&SqlFragment>,
    from: &str,
    root_pk: &str,
) -> SqlFragment {
    let aliases = &ctx.aliases;
    let per_record = !aliases.any_many(&agg.target_joins);
    let (expr, joins) = match &agg.condition {
        Some(condition) if per_record && aliases.any_many(&agg.condition_joins) => {
            let matching = condition.clone().wrap(
                &format!(
                    "{root_pk} IN (SELECT {root_pk} FROM {from}{} WHERE ",
                    aliases.render_indices(&agg.condition_joins)
                ),
                ")",
            );
            (agg.render_with(Some(&matching)), agg.target_joins.clone())
        }
        _ => {
            let mut joins = agg.target_joins.clone();
            joins.extend(agg.condition_joins.iter().copied());
            (agg.render(), joins)
        }
    };
    let mut stmt = expr.wrap("SELECT ", "");
    stmt.push_str(&format!(" FROM {from}{}", aliases.render_indices(&joins)));
    push_where(&mut stmt, records);
    stmt
}
