//! Sort compilation. Sort paths may cross to-one relations only; the root
//! primary key always closes the ordering so pages are stable.

use super::alias::JoinUsage;
use super::ast::SortTerm;
use super::context::{QueryContext, Resolved};
use super::errors::CompileError;
use super::sql::column_ref;

/// One `ORDER BY` key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    /// Column expression.
    pub expr: String,
    /// Descending order.
    pub descending: bool,
}

impl SortKey {
    /// `expr ASC|DESC` with `expr` replaced by `label`.
    pub fn render_as(&self, label: &str) -> String {
        format!("{label} {}", if self.descending { "DESC" } else { "ASC" })
    }

    /// `expr ASC|DESC`.
    pub fn render(&self) -> String {
        self.render_as(&self.expr)
    }
}

pub(crate) fn compile_sort(
    ctx: &mut QueryContext<'_>,
    terms: &[SortTerm],
) -> Result<Vec<SortKey>, CompileError> {
    let mut keys: Vec<SortKey> = Vec::with_capacity(terms.len() + 1);
    for term in terms {
        let resolved = match ctx.resolve(&term.path, JoinUsage::SORT) {
            Some(resolved) => resolved,
            None => {
                ctx.unresolved(&term.path, "sort")?;
                continue;
            }
        };
        if resolved.through_many() {
            return Err(CompileError::InvalidSort {
                path: term.path.to_string(),
                reason: "cannot sort through a to-many relation",
            });
        }
        let expr = match &resolved {
            Resolved::Column { alias, column, .. } => column_ref(alias, &column.name),
            Resolved::Relation { relation, .. } if relation.is_many() => {
                return Err(CompileError::InvalidSort {
                    path: term.path.to_string(),
                    reason: "cannot sort by a to-many relation",
                });
            }
            Resolved::Relation { .. } => {
                let Some(hop) = ctx.join_relation(&resolved, JoinUsage::SORT) else {
                    continue;
                };
                column_ref(&hop.alias, &hop.target.primary_key)
            }
        };
        if keys.iter().any(|k| k.expr == expr) {
            continue;
        }
        keys.push(SortKey {
            expr,
            descending: term.descending,
        });
    }
    let tiebreak = column_ref(&ctx.root_alias(), &ctx.root.primary_key);
    if !keys.iter().any(|k| k.expr == tiebreak) {
        keys.push(SortKey {
            expr: tiebreak,
            descending: false,
        });
    }
    Ok(keys)
}
