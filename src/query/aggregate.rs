//! Aggregate resolver: `count/sum/avg/min/max` over root columns or
//! related paths, optionally restricted by a condition.
//!
//! Each descriptor remembers which joins its target and its condition
//! reached, so the planner can give every aggregate its own row source.

use serde_json::Value as Json;

use super::alias::JoinUsage;
use super::ast::{AggFn, AggregateRequest};
use super::context::{QueryContext, Resolved};
use super::errors::CompileError;
use super::filter::compile_filter;
use super::sql::{column_ref, SqlFragment};

/// A resolved aggregate ready to render.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateDescriptor {
    /// Function.
    pub function: AggFn,
    /// Alias of the table holding the column.
    pub target_alias: String,
    /// Column aggregated.
    pub column: String,
    /// Condition restricting contributing rows.
    pub condition: Option<SqlFragment>,
    /// Output key under `meta.aggregate.<fn>`.
    pub label: String,
    /// Counts distinct keys; set for counts over related records.
    pub distinct: bool,
    /// Join indices reached by the target path.
    pub target_joins: Vec<usize>,
    /// Join indices reached by the condition.
    pub condition_joins: Vec<usize>,
}

impl AggregateDescriptor {
    /// Renders the aggregate expression.
    ///
    /// Conditioned counts become `SUM(CASE WHEN cond THEN 1 ELSE 0 END)`;
    /// other conditioned functions aggregate `CASE WHEN cond THEN col END`.
    pub fn render(&self) -> SqlFragment {
        self.render_with(self.condition.as_ref())
    }

    /// Renders the aggregate expression with `condition` in place of the
    /// compiled one.
    pub fn render_with(&self, condition: Option<&SqlFragment>) -> SqlFragment {
        let col = column_ref(&self.target_alias, &self.column);
        match (condition, self.function) {
            (None, AggFn::Count) if self.distinct => SqlFragment::raw(format!("COUNT(DISTINCT {col})")),
            (None, function) => SqlFragment::raw(format!("{}({col})", function.sql())),
            (Some(cond), AggFn::Count) => cond
                .clone()
                .wrap("SUM(CASE WHEN ", " THEN 1 ELSE 0 END)"),
            (Some(cond), function) => cond
                .clone()
                .wrap(&format!("{}(CASE WHEN ", function.sql()), &format!(" THEN {col} END)")),
        }
    }
}

/// Resolves aggregate requests. Unlike filters and fields, an aggregate
/// target that does not resolve is always an error.
pub(crate) fn resolve_aggregates(
    ctx: &mut QueryContext<'_>,
    requests: &[AggregateRequest],
) -> Result<Vec<AggregateDescriptor>, CompileError> {
    let mut out = Vec::with_capacity(requests.len());
    for request in requests {
        out.push(resolve_one(ctx, request)?);
    }
    Ok(out)
}

fn reject(request: &AggregateRequest, reason: &'static str) -> CompileError {
    CompileError::InvalidAggregate {
        function: request.function.name().to_string(),
        path: request.path.to_string(),
        reason,
    }
}

fn resolve_one(
    ctx: &mut QueryContext<'_>,
    request: &AggregateRequest,
) -> Result<AggregateDescriptor, CompileError> {
    let counts_root = request.path.is_empty() || request.path.segments() == ["*"];
    ctx.aliases.start_recording();
    let (target_alias, column, distinct) = if counts_root {
        if request.function != AggFn::Count {
            return Err(reject(request, "only count may target '*'"));
        }
        (ctx.root_alias(), ctx.root.primary_key.clone(), false)
    } else {
        match ctx.resolve(&request.path, JoinUsage::AGGREGATE) {
            Some(Resolved::Column { alias, column, .. }) => {
                let ty = column.scalar_type;
                if request.function != AggFn::Count && !(ty.is_numeric() || ty.is_temporal()) {
                    return Err(reject(request, "target must be a numeric or temporal column"));
                }
                (alias, column.name.clone(), false)
            }
            Some(resolved @ Resolved::Relation { .. }) => {
                if request.function != AggFn::Count {
                    return Err(reject(request, "relations can only be counted"));
                }
                let Some(hop) = ctx.join_relation(&resolved, JoinUsage::AGGREGATE) else {
                    return Err(reject(request, "relation could not be joined"));
                };
                (hop.alias, hop.target.primary_key.clone(), true)
            }
            None => return Err(reject(request, "path does not resolve")),
        }
    };
    let target_joins = ctx.aliases.take_recorded();
    ctx.aliases.start_recording();
    let condition = match &request.condition {
        Some(cond) if !matches!(cond, Json::Null) => {
            compile_filter(ctx, cond, JoinUsage::AGGREGATE)?.where_fragment()
        }
        _ => None,
    };
    let condition_joins = ctx.aliases.take_recorded();
    Ok(AggregateDescriptor {
        function: request.function,
        target_alias,
        column,
        condition,
        label: request.label.clone(),
        distinct,
        target_joins,
        condition_joins,
    })
}
