#![forbid(unsafe_code)]

//! Parsed form of the find DSLs: filter trees, field paths, sort terms,
//! metadata modes, and aggregate requests.
//!
//! Parsing is purely structural. Nothing here consults the catalog; deciding
//! whether a segment names a column or a relation happens during compilation.

use std::fmt;

use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use super::errors::CompileError;

/// Dot-separated path of field or relation names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldPath(SmallVec<[String; 4]>);

impl FieldPath {
    /// The empty path, naming the root table itself.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses `a.b.c`, ignoring empty segments.
    pub fn parse(text: &str) -> Self {
        Self(
            text.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: &str) -> Self {
        let mut next = self.clone();
        next.0.push(segment.to_string());
        next
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True when the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last segment, if any.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Everything but the last segment.
    pub fn parent(&self) -> FieldPath {
        let mut parent = self.clone();
        parent.0.pop();
        parent
    }

    /// True when the final segment is the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.last() == Some("*")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Binary comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `<>`
    Neq,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl CmpOp {
    /// SQL spelling.
    pub fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Neq => "<>",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }

    fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "eq" => CmpOp::Eq,
            "neq" => CmpOp::Neq,
            "gt" => CmpOp::Gt,
            "gte" => CmpOp::Gte,
            "lt" => CmpOp::Lt,
            "lte" => CmpOp::Lte,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Neq => "neq",
            CmpOp::Gt => "gt",
            CmpOp::Gte => "gte",
            CmpOp::Lt => "lt",
            CmpOp::Lte => "lte",
        }
    }
}

/// Predicate operators of the filter DSL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    /// Direct comparison.
    Cmp(CmpOp),
    /// Membership.
    In,
    /// Non-membership.
    NotIn,
    /// Inclusive range `[low, high]`.
    Between,
    /// Null test; operand truthiness picks `IS NULL` or `IS NOT NULL`.
    IsNull,
    /// Accent and case insensitive substring.
    Contains,
    /// Accent and case insensitive prefix.
    StartsWith,
    /// Accent and case insensitive suffix.
    EndsWith,
    /// Related row count compared against a number.
    Count(CmpOp),
    /// Related id set equals the operand exactly.
    EqSet,
}

impl Operator {
    /// Parses an operator key. Count is handled separately since its operand
    /// carries the comparison.
    fn parse(key: &str) -> Option<Self> {
        if let Some(cmp) = CmpOp::parse(key) {
            return Some(Operator::Cmp(cmp));
        }
        Some(match key {
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "between" => Operator::Between,
            "is_null" => Operator::IsNull,
            "contains" => Operator::Contains,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "eq_set" => Operator::EqSet,
            _ => return None,
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Cmp(cmp) => f.write_str(cmp.name()),
            Operator::In => f.write_str("in"),
            Operator::NotIn => f.write_str("not_in"),
            Operator::Between => f.write_str("between"),
            Operator::IsNull => f.write_str("is_null"),
            Operator::Contains => f.write_str("contains"),
            Operator::StartsWith => f.write_str("starts_with"),
            Operator::EndsWith => f.write_str("ends_with"),
            Operator::Count(cmp) => write!(f, "count.{}", cmp.name()),
            Operator::EqSet => f.write_str("eq_set"),
        }
    }
}

/// A single `path op operand` leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    /// Full path from the root table.
    pub path: FieldPath,
    /// Operator.
    pub op: Operator,
    /// Raw operand; coerced during compilation.
    pub operand: Json,
}

/// Filter tree node.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    /// All children must hold.
    And(Vec<FilterExpr>),
    /// Any child must hold.
    Or(Vec<FilterExpr>),
    /// Child must not hold.
    Not(Box<FilterExpr>),
    /// Leaf predicate.
    Predicate(Predicate),
}

enum Key<'a> {
    And,
    Or,
    Not,
    Count,
    Op(Operator),
    Field(&'a str),
}

fn classify(key: &str) -> Key<'_> {
    let bare = key.strip_prefix('_').unwrap_or(key);
    match bare {
        "and" => Key::And,
        "or" => Key::Or,
        "not" => Key::Not,
        "count" => Key::Count,
        other => match Operator::parse(other) {
            Some(op) => Key::Op(op),
            None => Key::Field(key),
        },
    }
}

/// Parses a filter document into its root-level clauses.
///
/// Sibling keys of the root object become separate clauses that the caller
/// conjoins; an explicit `and`/`or` key yields a single grouped clause.
pub fn parse_filter(value: &Json) -> Result<Vec<FilterExpr>, CompileError> {
    match value {
        Json::Null => Ok(Vec::new()),
        Json::Object(map) => parse_entries(map, &FieldPath::root()),
        _ => Err(CompileError::malformed("filter must be an object")),
    }
}

fn parse_object(map: &Map<String, Json>, path: &FieldPath) -> Result<Option<FilterExpr>, CompileError> {
    let mut nodes = parse_entries(map, path)?;
    Ok(match nodes.len() {
        0 => None,
        1 => nodes.pop(),
        _ => Some(FilterExpr::And(nodes)),
    })
}

fn parse_entries(map: &Map<String, Json>, path: &FieldPath) -> Result<Vec<FilterExpr>, CompileError> {
    let mut nodes = Vec::with_capacity(map.len());
    for (key, value) in map {
        match classify(key) {
            Key::And => nodes.push(FilterExpr::And(parse_children(key, value, path)?)),
            Key::Or => nodes.push(FilterExpr::Or(parse_children(key, value, path)?)),
            Key::Not => {
                let Json::Object(inner) = value else {
                    return Err(CompileError::malformed(format!("'{key}' expects an object")));
                };
                if let Some(child) = parse_object(inner, path)? {
                    nodes.push(FilterExpr::Not(Box::new(child)));
                }
            }
            Key::Count => {
                require_field(key, path)?;
                nodes.extend(parse_count(value, path)?);
            }
            Key::Op(op) => {
                require_field(key, path)?;
                nodes.push(FilterExpr::Predicate(Predicate {
                    path: path.clone(),
                    op,
                    operand: value.clone(),
                }));
            }
            Key::Field(name) => {
                let child = path.child(name);
                match value {
                    Json::Object(inner) => {
                        if let Some(expr) = parse_object(inner, &child)? {
                            nodes.push(expr);
                        }
                    }
                    scalar => nodes.push(FilterExpr::Predicate(Predicate {
                        path: child,
                        op: Operator::Cmp(CmpOp::Eq),
                        operand: scalar.clone(),
                    })),
                }
            }
        }
    }
    Ok(nodes)
}

fn require_field(key: &str, path: &FieldPath) -> Result<(), CompileError> {
    if path.is_empty() {
        return Err(CompileError::malformed(format!(
            "operator '{key}' must be nested under a field"
        )));
    }
    Ok(())
}

fn parse_children(key: &str, value: &Json, path: &FieldPath) -> Result<Vec<FilterExpr>, CompileError> {
    match value {
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Json::Object(inner) = item else {
                    return Err(CompileError::malformed(format!(
                        "'{key}' children must be objects"
                    )));
                };
                if let Some(expr) = parse_object(inner, path)? {
                    out.push(expr);
                }
            }
            Ok(out)
        }
        Json::Object(inner) => Ok(parse_object(inner, path)?.into_iter().collect()),
        _ => Err(CompileError::malformed(format!(
            "'{key}' expects an array of objects"
        ))),
    }
}

fn parse_count(value: &Json, path: &FieldPath) -> Result<Vec<FilterExpr>, CompileError> {
    let Json::Object(ops) = value else {
        return Err(CompileError::operand(path, "count", "an object such as {\"gte\": 2}"));
    };
    let mut out = Vec::with_capacity(ops.len());
    for (key, operand) in ops {
        let bare = key.strip_prefix('_').unwrap_or(key);
        let Some(cmp) = CmpOp::parse(bare) else {
            return Err(CompileError::operand(path, "count", "comparison keys eq/neq/gt/gte/lt/lte"));
        };
        out.push(FilterExpr::Predicate(Predicate {
            path: path.clone(),
            op: Operator::Count(cmp),
            operand: operand.clone(),
        }));
    }
    Ok(out)
}

/// Parses a comma separated field list.
pub fn parse_fields<S: AsRef<str>>(items: &[S]) -> Vec<FieldPath> {
    split_list(items).map(|item| FieldPath::parse(&item)).collect()
}

fn split_list<S: AsRef<str>>(items: &[S]) -> impl Iterator<Item = String> + '_ {
    items
        .iter()
        .flat_map(|item| item.as_ref().split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One `field` or `-field` sort term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortTerm {
    /// Path to sort by.
    pub path: FieldPath,
    /// Descending when prefixed with `-`.
    pub descending: bool,
}

/// Parses a comma separated sort list.
pub fn parse_sort<S: AsRef<str>>(items: &[S]) -> Vec<SortTerm> {
    split_list(items)
        .map(|item| match item.strip_prefix('-') {
            Some(rest) => SortTerm {
                path: FieldPath::parse(rest),
                descending: true,
            },
            None => SortTerm {
                path: FieldPath::parse(item.strip_prefix('+').unwrap_or(&item)),
                descending: false,
            },
        })
        .filter(|term| !term.path.is_empty())
        .collect()
}

/// Which counts to attach to a find response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaMode {
    /// Unfiltered row count.
    pub total_count: bool,
    /// Row count after filtering, before pagination.
    pub filter_count: bool,
}

impl MetaMode {
    /// Parses `totalCount`, `filterCount`, `*`, or a comma list of them.
    pub fn parse(text: Option<&str>) -> Result<Self, CompileError> {
        let mut mode = MetaMode::default();
        let Some(text) = text else {
            return Ok(mode);
        };
        for item in split_list(&[text]) {
            match item.as_str() {
                "*" => {
                    mode.total_count = true;
                    mode.filter_count = true;
                }
                "totalCount" => mode.total_count = true,
                "filterCount" => mode.filter_count = true,
                _ => return Err(CompileError::InvalidMeta { value: item }),
            }
        }
        Ok(mode)
    }

    /// True when any count was requested.
    pub fn any(self) -> bool {
        self.total_count || self.filter_count
    }
}

/// Aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFn {
    /// `COUNT`
    Count,
    /// `SUM`
    Sum,
    /// `AVG`
    Avg,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
}

impl AggFn {
    /// Parses a lower-case function name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.strip_prefix('_').unwrap_or(name) {
            "count" => AggFn::Count,
            "sum" => AggFn::Sum,
            "avg" => AggFn::Avg,
            "min" => AggFn::Min,
            "max" => AggFn::Max,
            _ => return None,
        })
    }

    /// Lower-case DSL name, also the key in `meta.aggregate`.
    pub fn name(self) -> &'static str {
        match self {
            AggFn::Count => "count",
            AggFn::Sum => "sum",
            AggFn::Avg => "avg",
            AggFn::Min => "min",
            AggFn::Max => "max",
        }
    }

    /// SQL function name.
    pub fn sql(self) -> &'static str {
        match self {
            AggFn::Count => "COUNT",
            AggFn::Sum => "SUM",
            AggFn::Avg => "AVG",
            AggFn::Min => "MIN",
            AggFn::Max => "MAX",
        }
    }
}

/// One requested aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateRequest {
    /// Function.
    pub function: AggFn,
    /// Target path; `*` or empty counts root records.
    pub path: FieldPath,
    /// Optional filter restricting which rows contribute.
    pub condition: Option<Json>,
    /// Output key under `meta.aggregate.<fn>`.
    pub label: String,
}

/// Parses `{fn: path | {field, condition?, as?} | [...]}`.
pub fn parse_aggregates(value: &Json) -> Result<Vec<AggregateRequest>, CompileError> {
    let map = match value {
        Json::Null => return Ok(Vec::new()),
        Json::Object(map) => map,
        _ => {
            return Err(CompileError::MalformedAggregate {
                reason: "aggregate must be an object".into(),
            })
        }
    };
    let mut out = Vec::new();
    for (name, spec) in map {
        let function = AggFn::parse(name).ok_or_else(|| CompileError::UnknownAggregateFunction {
            function: name.clone(),
        })?;
        match spec {
            Json::Array(items) => {
                for item in items {
                    out.push(parse_aggregate_target(function, item)?);
                }
            }
            single => out.push(parse_aggregate_target(function, single)?),
        }
    }
    Ok(out)
}

fn parse_aggregate_target(function: AggFn, spec: &Json) -> Result<AggregateRequest, CompileError> {
    match spec {
        Json::String(path) => Ok(AggregateRequest {
            function,
            path: FieldPath::parse(path),
            condition: None,
            label: path.clone(),
        }),
        Json::Object(obj) => {
            let Some(Json::String(field)) = obj.get("field") else {
                return Err(CompileError::MalformedAggregate {
                    reason: format!("{} target needs a 'field' string", function.name()),
                });
            };
            let label = match obj.get("as") {
                Some(Json::String(label)) => label.clone(),
                _ => field.clone(),
            };
            Ok(AggregateRequest {
                function,
                path: FieldPath::parse(field),
                condition: obj.get("condition").filter(|c| !c.is_null()).cloned(),
                label,
            })
        }
        _ => Err(CompileError::MalformedAggregate {
            reason: format!("{} target must be a path or an object", function.name()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pred(path: &str, op: Operator, operand: Json) -> FilterExpr {
        FilterExpr::Predicate(Predicate {
            path: FieldPath::parse(path),
            op,
            operand,
        })
    }

    #[test]
    fn nested_combinators_keep_their_shape() {
        let clauses = parse_filter(&json!({
            "and": [
                {"id": {"eq": 1}},
                {"or": [{"name": {"eq": "a"}}, {"name": {"eq": "b"}}]}
            ]
        }))
        .expect("filter parses");
        assert_eq!(
            clauses,
            vec![FilterExpr::And(vec![
                pred("id", Operator::Cmp(CmpOp::Eq), json!(1)),
                FilterExpr::Or(vec![
                    pred("name", Operator::Cmp(CmpOp::Eq), json!("a")),
                    pred("name", Operator::Cmp(CmpOp::Eq), json!("b")),
                ]),
            ])]
        );
    }

    #[test]
    fn relation_paths_prefix_nested_predicates() {
        let clauses = parse_filter(&json!({
            "author": {"or": [{"name": {"_contains": "x"}}, {"email": "e"}]},
            "posts": {"count": {"gte": 2, "lt": 5}}
        }))
        .expect("filter parses");
        assert_eq!(
            clauses,
            vec![
                FilterExpr::Or(vec![
                    pred("author.name", Operator::Contains, json!("x")),
                    pred("author.email", Operator::Cmp(CmpOp::Eq), json!("e")),
                ]),
                FilterExpr::And(vec![
                    pred("posts", Operator::Count(CmpOp::Gte), json!(2)),
                    pred("posts", Operator::Count(CmpOp::Lt), json!(5)),
                ]),
            ]
        );
    }

    #[test]
    fn not_groups_siblings_under_and() {
        let clauses =
            parse_filter(&json!({"not": {"a": {"eq": 1}, "b": {"is_null": true}}})).expect("parses");
        assert_eq!(
            clauses,
            vec![FilterExpr::Not(Box::new(FilterExpr::And(vec![
                pred("a", Operator::Cmp(CmpOp::Eq), json!(1)),
                pred("b", Operator::IsNull, json!(true)),
            ])))]
        );
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(matches!(
            parse_filter(&json!([1, 2])),
            Err(CompileError::MalformedFilter { .. })
        ));
        assert!(matches!(
            parse_filter(&json!({"and": 3})),
            Err(CompileError::MalformedFilter { .. })
        ));
        assert!(matches!(
            parse_filter(&json!({"eq": 3})),
            Err(CompileError::MalformedFilter { .. })
        ));
        assert!(matches!(
            parse_filter(&json!({"posts": {"count": 3}})),
            Err(CompileError::MalformedOperand { .. })
        ));
    }

    #[test]
    fn sort_and_field_lists_split_on_commas() {
        let sort = parse_sort(&["-createdAt, name", "+author.name"]);
        assert_eq!(sort.len(), 3);
        assert!(sort[0].descending);
        assert_eq!(sort[1].path.to_string(), "name");
        assert_eq!(sort[2].path.to_string(), "author.name");
        assert!(!sort[2].descending);

        let fields = parse_fields(&["id,author", "tags.*"]);
        assert_eq!(fields.len(), 3);
        assert!(fields[2].is_wildcard());
    }

    #[test]
    fn meta_modes_parse() {
        assert_eq!(
            MetaMode::parse(Some("*")).expect("meta"),
            MetaMode {
                total_count: true,
                filter_count: true
            }
        );
        assert!(MetaMode::parse(Some("filterCount")).expect("meta").filter_count);
        assert!(matches!(
            MetaMode::parse(Some("rows")),
            Err(CompileError::InvalidMeta { .. })
        ));
    }

    #[test]
    fn aggregates_accept_paths_objects_and_lists() {
        let requests = parse_aggregates(&json!({
            "count": "id",
            "sum": ["price", {"field": "price", "condition": {"paid": {"eq": true}}, "as": "paid"}]
        }))
        .expect("aggregates parse");
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].function, AggFn::Count);
        assert_eq!(requests[2].label, "paid");
        assert!(requests[2].condition.is_some());
        assert!(matches!(
            parse_aggregates(&json!({"median": "price"})),
            Err(CompileError::UnknownAggregateFunction { .. })
        ));
    }
}
