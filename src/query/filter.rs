//! Filter compiler: lowers a filter document into parameterized SQL
//! fragments, planning the joins its relation paths need.
//!
//! Operator semantics:
//!
//! * `eq`/`neq`/`gt`/`gte`/`lt`/`lte` bind one parameter coerced to the
//!   column type; `eq: null` and `neq: null` become `IS NULL`/`IS NOT NULL`.
//! * `between` binds `[low, high]` as given.
//! * `in: []` is always false (`1 = 0`), `not_in: []` always true (`1 = 1`).
//! * `contains`/`starts_with`/`ends_with` compare through the `unaccent`
//!   SQL function with `%v%`, `v%`, `%v` patterns. `%`, `_` and `\` in the
//!   operand match literally.
//! * `count` compares a correlated `COUNT(*)` subquery, so `count: {eq: 0}`
//!   matches records with no links. `count` and `eq_set` never add a join to
//!   the outer statement.
#![forbid(unsafe_code)]

use std::collections::HashSet;

use serde_json::Value as Json;

use crate::catalog::{LinkSpec, ScalarType};

use super::alias::JoinUsage;
use super::ast::{parse_filter, CmpOp, FieldPath, FilterExpr, Operator, Predicate};
use super::context::{QueryContext, Resolved};
use super::errors::CompileError;
use super::sql::{column_ref, quote_ident, SqlFragment};
use super::value::{truthy, SqlValue};

/// How a clause combines with the clauses before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combinator {
    /// Conjunction.
    And,
    /// Disjunction.
    Or,
}

/// One root-level clause of a compiled filter.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterClause {
    /// Combinator joining this clause to the previous one.
    pub combinator: Combinator,
    /// SQL and parameters.
    pub fragment: SqlFragment,
}

/// Compiled filter: root-level clauses in document order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledFilter {
    /// Clauses in order.
    pub clauses: Vec<FilterClause>,
}

impl CompiledFilter {
    /// True when no predicate survived compilation.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Folds the clauses into a single WHERE expression.
    pub fn where_fragment(&self) -> Option<SqlFragment> {
        let mut iter = self.clauses.iter();
        let first = iter.next()?;
        let mut out = first.fragment.clone();
        for clause in iter {
            out.push_str(match clause.combinator {
                Combinator::And => " AND ",
                Combinator::Or => " OR ",
            });
            out.push(clause.fragment.clone());
        }
        Some(out)
    }
}

/// Compiles `filter` against the context's root table. Joins are recorded in
/// the context's alias map with `usage`.
pub(crate) fn compile_filter(
    ctx: &mut QueryContext<'_>,
    filter: &Json,
    usage: JoinUsage,
) -> Result<CompiledFilter, CompileError> {
    let roots = parse_filter(filter)?;
    let mut compiler = FilterCompiler { ctx, usage };
    let mut clauses = Vec::with_capacity(roots.len());
    for node in &roots {
        if let Some(fragment) = compiler.node(node)? {
            clauses.push(FilterClause {
                combinator: Combinator::And,
                fragment,
            });
        }
    }
    Ok(CompiledFilter { clauses })
}

struct FilterCompiler<'a, 'c> {
    ctx: &'a mut QueryContext<'c>,
    usage: JoinUsage,
}

impl<'a, 'c> FilterCompiler<'a, 'c> {
    fn node(&mut self, node: &FilterExpr) -> Result<Option<SqlFragment>, CompileError> {
        match node {
            FilterExpr::And(children) => self.group(children, " AND "),
            FilterExpr::Or(children) => self.group(children, " OR "),
            FilterExpr::Not(child) => Ok(self.node(child)?.map(|f| f.wrap("NOT (", ")"))),
            FilterExpr::Predicate(pred) => self.predicate(pred),
        }
    }

    fn group(
        &mut self,
        children: &[FilterExpr],
        separator: &str,
    ) -> Result<Option<SqlFragment>, CompileError> {
        let mut parts = Vec::with_capacity(children.len());
        for child in children {
            if let Some(fragment) = self.node(child)? {
                parts.push(fragment);
            }
        }
        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(SqlFragment::join(parts, separator).wrap("(", ")")))
    }

    fn predicate(&mut self, pred: &Predicate) -> Result<Option<SqlFragment>, CompileError> {
        let Some(resolved) = self.ctx.resolve(&pred.path, self.usage) else {
            self.ctx.unresolved(&pred.path, "filter")?;
            return Ok(None);
        };
        match &resolved {
            Resolved::Column { alias, column, .. } => {
                let col = column_ref(alias, &column.name);
                scalar(&pred.path, &col, column.scalar_type, pred.op, &pred.operand).map(Some)
            }
            Resolved::Relation {
                parent_alias,
                relation,
                target,
                ..
            } => match pred.op {
                Operator::Count(_) | Operator::EqSet if !relation.is_many() => {
                    Err(CompileError::invalid_op(
                        &pred.path,
                        pred.op,
                        "only valid on a to-many relation",
                    ))
                }
                Operator::Count(cmp) => {
                    let parent = column_ref(parent_alias, &relation.join_key);
                    let link = relation.link(target);
                    let scratch = self.ctx.aliases.scratch();
                    count(&pred.path, &parent, link, &scratch, cmp, &pred.operand).map(Some)
                }
                Operator::EqSet => {
                    let parent = column_ref(parent_alias, &relation.join_key);
                    let link = relation.link(target);
                    let scratch = self.ctx.aliases.scratch();
                    eq_set(
                        &pred.path,
                        &parent,
                        link,
                        &scratch,
                        target.primary_type(),
                        &pred.operand,
                    )
                    .map(Some)
                }
                op => {
                    let pk_type = target.primary_type();
                    let pk = target.primary_key.clone();
                    let Some(hop) = self.ctx.join_relation(&resolved, self.usage) else {
                        return Ok(None);
                    };
                    let col = column_ref(&hop.alias, &pk);
                    scalar(&pred.path, &col, pk_type, op, &pred.operand).map(Some)
                }
            },
        }
    }
}

fn scalar(
    path: &FieldPath,
    col: &str,
    ty: ScalarType,
    op: Operator,
    operand: &Json,
) -> Result<SqlFragment, CompileError> {
    match op {
        Operator::Cmp(CmpOp::Eq) if operand.is_null() => Ok(SqlFragment::raw(format!("{col} IS NULL"))),
        Operator::Cmp(CmpOp::Neq) if operand.is_null() => {
            Ok(SqlFragment::raw(format!("{col} IS NOT NULL")))
        }
        Operator::Cmp(cmp) => {
            if operand.is_array() || operand.is_object() {
                return Err(CompileError::operand(path, op, "a scalar"));
            }
            Ok(SqlFragment::with_params(
                format!("{col} {} ?", cmp.sql()),
                vec![SqlValue::coerce(operand, ty)],
            ))
        }
        Operator::In | Operator::NotIn => {
            let items = list_operand(path, op, operand, ty)?;
            let negate = op == Operator::NotIn;
            if items.is_empty() {
                return Ok(SqlFragment::raw(if negate { "1 = 1" } else { "1 = 0" }));
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            let keyword = if negate { "NOT IN" } else { "IN" };
            Ok(SqlFragment::with_params(
                format!("{col} {keyword} ({placeholders})"),
                items,
            ))
        }
        Operator::Between => {
            let (low, high) = pair_operand(path, op, operand, ty)?;
            Ok(SqlFragment::with_params(
                format!("{col} BETWEEN ? AND ?"),
                vec![low, high],
            ))
        }
        Operator::IsNull => Ok(SqlFragment::raw(if truthy(operand) {
            format!("{col} IS NULL")
        } else {
            format!("{col} IS NOT NULL")
        })),
        Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
            let text = escape_like(&text_operand(path, op, operand)?);
            let pattern = match op {
                Operator::Contains => format!("%{text}%"),
                Operator::StartsWith => format!("{text}%"),
                _ => format!("%{text}"),
            };
            Ok(SqlFragment::with_params(
                format!("unaccent({col}) LIKE unaccent(?) ESCAPE '\\'"),
                vec![SqlValue::Text(pattern)],
            ))
        }
        Operator::Count(_) | Operator::EqSet => Err(CompileError::invalid_op(
            path,
            op,
            "only valid on a to-many relation",
        )),
    }
}

fn count(
    path: &FieldPath,
    parent: &str,
    link: LinkSpec<'_>,
    scratch: &str,
    cmp: CmpOp,
    operand: &Json,
) -> Result<SqlFragment, CompileError> {
    let number = match SqlValue::coerce(operand, ScalarType::Int) {
        value @ (SqlValue::Int(_) | SqlValue::Float(_)) => value,
        _ => return Err(CompileError::operand(path, Operator::Count(cmp), "a number")),
    };
    Ok(SqlFragment::with_params(
        format!(
            "(SELECT COUNT(*) FROM {} AS {} WHERE {} = {parent}) {} ?",
            quote_ident(link.table),
            quote_ident(scratch),
            column_ref(scratch, link.parent_key),
            cmp.sql()
        ),
        vec![number],
    ))
}

fn eq_set(
    path: &FieldPath,
    parent: &str,
    link: LinkSpec<'_>,
    scratch: &str,
    id_type: ScalarType,
    operand: &Json,
) -> Result<SqlFragment, CompileError> {
    let mut seen = HashSet::new();
    let ids: Vec<SqlValue> = list_operand(path, Operator::EqSet, operand, id_type)?
        .into_iter()
        .filter(|id| seen.insert(id.identity()))
        .collect();
    let table = quote_ident(link.table);
    let alias = quote_ident(scratch);
    let parent_key = column_ref(scratch, link.parent_key);
    if ids.is_empty() {
        return Ok(SqlFragment::raw(format!(
            "NOT EXISTS (SELECT 1 FROM {table} AS {alias} WHERE {parent_key} = {parent})"
        )));
    }
    let target_key = column_ref(scratch, link.target_key);
    let n = ids.len();
    let placeholders = vec!["?"; n].join(", ");
    Ok(SqlFragment::with_params(
        format!(
            "EXISTS (SELECT 1 FROM {table} AS {alias} WHERE {parent_key} = {parent} \
             GROUP BY {parent_key} HAVING COUNT(DISTINCT {target_key}) = {n} \
             AND COUNT(DISTINCT CASE WHEN {target_key} IN ({placeholders}) THEN {target_key} END) = {n})"
        ),
        ids,
    ))
}

fn list_operand(
    path: &FieldPath,
    op: Operator,
    operand: &Json,
    ty: ScalarType,
) -> Result<Vec<SqlValue>, CompileError> {
    match operand {
        Json::Array(items) => Ok(items.iter().map(|v| SqlValue::coerce(v, ty)).collect()),
        Json::String(text) => Ok(text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| SqlValue::coerce(&Json::String(s.to_string()), ty))
            .collect()),
        _ => Err(CompileError::operand(path, op, "an array")),
    }
}

fn pair_operand(
    path: &FieldPath,
    op: Operator,
    operand: &Json,
    ty: ScalarType,
) -> Result<(SqlValue, SqlValue), CompileError> {
    let items = match operand {
        Json::Array(_) | Json::String(_) => list_operand(path, op, operand, ty)?,
        _ => Vec::new(),
    };
    match <[SqlValue; 2]>::try_from(items) {
        Ok([low, high]) => Ok((low, high)),
        Err(_) => Err(CompileError::operand(path, op, "a two-element array")),
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn text_operand(path: &FieldPath, op: Operator, operand: &Json) -> Result<String, CompileError> {
    match operand {
        Json::String(s) => Ok(s.clone()),
        Json::Number(n) => Ok(n.to_string()),
        Json::Bool(b) => Ok(b.to_string()),
        _ => Err(CompileError::operand(path, op, "a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::context::CompileOptions;
    use crate::query::fixtures::blog_catalog;
    use proptest::prelude::*;
    use serde_json::json;

    fn compile_on(
        table: &str,
        filter: Json,
        options: CompileOptions,
    ) -> Result<(Option<SqlFragment>, Vec<String>), CompileError> {
        let catalog = blog_catalog();
        let mut ctx = QueryContext::new(&catalog, table, options)?;
        let compiled = compile_filter(&mut ctx, &filter, JoinUsage::FILTER)?;
        let joins = ctx.aliases.joins().iter().map(|j| j.path.clone()).collect();
        Ok((compiled.where_fragment(), joins))
    }

    fn compile(table: &str, filter: Json) -> SqlFragment {
        compile_on(table, filter, CompileOptions::default())
            .expect("filter compiles")
            .0
            .expect("filter is not empty")
    }

    #[test]
    fn nested_and_or_is_not_flattened() {
        let fragment = compile(
            "users",
            json!({"and": [{"id": {"eq": 1}}, {"or": [{"name": {"eq": "a"}}, {"name": {"eq": "b"}}]}]}),
        );
        assert_eq!(
            fragment.sql,
            "(\"r\".\"id\" = ? AND (\"r\".\"name\" = ? OR \"r\".\"name\" = ?))"
        );
        assert_eq!(
            fragment.params,
            vec![SqlValue::Int(1), SqlValue::from("a"), SqlValue::from("b")]
        );
    }

    #[test]
    fn eq_binds_one_coerced_parameter() {
        let fragment = compile("users", json!({"age": {"eq": "42"}}));
        assert_eq!(fragment.sql, "\"r\".\"age\" = ?");
        assert_eq!(fragment.params, vec![SqlValue::Int(42)]);

        let fragment = compile("users", json!({"active": {"_eq": "true"}}));
        assert_eq!(fragment.params, vec![SqlValue::Bool(true)]);
    }

    #[test]
    fn between_keeps_operand_order() {
        let fragment = compile("users", json!({"age": {"between": [50, 10]}}));
        assert_eq!(fragment.sql, "\"r\".\"age\" BETWEEN ? AND ?");
        assert_eq!(fragment.params, vec![SqlValue::Int(50), SqlValue::Int(10)]);

        let err = compile_on("users", json!({"age": {"between": [1]}}), CompileOptions::default())
            .expect_err("single bound");
        assert!(matches!(err, CompileError::MalformedOperand { .. }));
    }

    #[test]
    fn empty_membership_lists_are_constant() {
        assert_eq!(compile("users", json!({"id": {"in": []}})).sql, "1 = 0");
        assert_eq!(compile("users", json!({"id": {"not_in": []}})).sql, "1 = 1");
        let fragment = compile("users", json!({"id": {"in": [1, "2"]}}));
        assert_eq!(fragment.sql, "\"r\".\"id\" IN (?, ?)");
        assert_eq!(fragment.params, vec![SqlValue::Int(1), SqlValue::Int(2)]);
    }

    #[test]
    fn text_matching_goes_through_unaccent() {
        let fragment = compile("users", json!({"name": {"contains": "José"}}));
        assert_eq!(fragment.sql, "unaccent(\"r\".\"name\") LIKE unaccent(?) ESCAPE '\\'");
        assert_eq!(fragment.params, vec![SqlValue::from("%José%")]);
        assert_eq!(
            compile("users", json!({"name": {"starts_with": "a"}})).params,
            vec![SqlValue::from("a%")]
        );
        assert_eq!(
            compile("users", json!({"name": {"ends_with": "a"}})).params,
            vec![SqlValue::from("%a")]
        );
        assert_eq!(
            compile("users", json!({"name": {"contains": "50%_off\\"}})).params,
            vec![SqlValue::from("%50\\%\\_off\\\\%")]
        );
    }

    #[test]
    fn null_tests_follow_operand_truthiness() {
        assert_eq!(
            compile("users", json!({"email": {"is_null": true}})).sql,
            "\"r\".\"email\" IS NULL"
        );
        assert_eq!(
            compile("users", json!({"email": {"is_null": "false"}})).sql,
            "\"r\".\"email\" IS NOT NULL"
        );
        assert_eq!(
            compile("users", json!({"email": {"eq": null}})).sql,
            "\"r\".\"email\" IS NULL"
        );
    }

    #[test]
    fn not_wraps_its_child() {
        let fragment = compile("users", json!({"not": {"name": {"eq": "a"}}}));
        assert_eq!(fragment.sql, "NOT (\"r\".\"name\" = ?)");
    }

    #[test]
    fn relation_paths_join_once() {
        let (fragment, joins) = compile_on(
            "posts",
            json!({"author": {"name": {"eq": "a"}}, "or": [{"author": {"age": {"gt": 3}}}]}),
            CompileOptions::default(),
        )
        .expect("compiles");
        assert_eq!(joins, vec!["author".to_string()]);
        assert_eq!(
            fragment.expect("fragment").sql,
            "\"j0\".\"name\" = ? AND (\"j0\".\"age\" > ?)"
        );
    }

    #[test]
    fn operator_on_relation_compares_primary_key() {
        let fragment = compile("posts", json!({"author": {"eq": "5"}}));
        assert_eq!(fragment.sql, "\"j0\".\"id\" = ?");
        assert_eq!(fragment.params, vec![SqlValue::Int(5)]);
    }

    #[test]
    fn count_compiles_to_a_correlated_subquery() {
        let (fragment, joins) = compile_on(
            "users",
            json!({"posts": {"count": {"gte": 2}}}),
            CompileOptions::default(),
        )
        .expect("compiles");
        assert!(joins.is_empty());
        let fragment = fragment.expect("fragment");
        assert_eq!(
            fragment.sql,
            "(SELECT COUNT(*) FROM \"posts\" AS \"s0\" WHERE \"s0\".\"authorId\" = \"r\".\"id\") >= ?"
        );
        assert_eq!(fragment.params, vec![SqlValue::Int(2)]);
    }

    #[test]
    fn eq_set_checks_size_and_membership() {
        let fragment = compile("posts", json!({"tags": {"eq_set": [3, 1, 3]}}));
        assert_eq!(
            fragment.sql,
            "EXISTS (SELECT 1 FROM \"post_tags\" AS \"s0\" WHERE \"s0\".\"postId\" = \"r\".\"id\" \
             GROUP BY \"s0\".\"postId\" HAVING COUNT(DISTINCT \"s0\".\"tagId\") = 2 \
             AND COUNT(DISTINCT CASE WHEN \"s0\".\"tagId\" IN (?, ?) THEN \"s0\".\"tagId\" END) = 2)"
        );
        assert_eq!(fragment.params, vec![SqlValue::Int(3), SqlValue::Int(1)]);

        let empty = compile("posts", json!({"tags": {"eq_set": []}}));
        assert!(empty.sql.starts_with("NOT EXISTS"));
    }

    #[test]
    fn relation_operators_reject_scalars_and_to_one() {
        let err = compile_on("users", json!({"name": {"count": {"gt": 1}}}), CompileOptions::default())
            .expect_err("count on scalar");
        assert!(matches!(err, CompileError::InvalidOperator { .. }));
        let err = compile_on("posts", json!({"author": {"eq_set": [1]}}), CompileOptions::default())
            .expect_err("eq_set on to-one");
        assert!(matches!(err, CompileError::InvalidOperator { .. }));
    }

    #[test]
    fn unresolved_paths_follow_policy() {
        let (fragment, _) = compile_on(
            "users",
            json!({"nmae": {"eq": "typo"}, "age": {"gt": 1}}),
            CompileOptions::default(),
        )
        .expect("lenient compiles");
        assert_eq!(fragment.expect("fragment").sql, "\"r\".\"age\" > ?");

        let (fragment, joins) = compile_on(
            "posts",
            json!({"author": {"missing": {"eq": 1}}}),
            CompileOptions::default(),
        )
        .expect("lenient compiles");
        assert!(fragment.is_none());
        assert!(joins.is_empty());

        let err = compile_on("users", json!({"nmae": {"eq": "typo"}}), CompileOptions::strict())
            .expect_err("strict rejects");
        assert!(matches!(err, CompileError::UnresolvedPath { .. }));
    }

    proptest! {
        #[test]
        fn eq_always_binds_exactly_one_parameter(v in any::<i64>()) {
            let fragment = compile("users", json!({"age": {"eq": v}}));
            prop_assert_eq!(fragment.params, vec![SqlValue::Int(v)]);
            prop_assert_eq!(fragment.sql.matches('?').count(), 1);
        }

        #[test]
        fn eq_coerces_numeric_strings(v in any::<i64>()) {
            let fragment = compile("users", json!({"age": {"eq": v.to_string()}}));
            prop_assert_eq!(fragment.params, vec![SqlValue::Int(v)]);
        }

        #[test]
        fn between_never_swaps(a in any::<i64>(), b in any::<i64>()) {
            let fragment = compile("users", json!({"age": {"between": [a, b]}}));
            prop_assert_eq!(fragment.params, vec![SqlValue::Int(a), SqlValue::Int(b)]);
        }
    }
}
