//! Request-scoped alias memoization and the join plan it produces.
//!
//! Every distinct relation path gets exactly one alias, and the first
//! consumer to reach a path (projection, filter, sort, or aggregate) fixes the
//! join's position in the plan. Later consumers only add their usage bit, so
//! a statement that needs a subset of consumers can render just those joins.

use std::collections::HashMap;
use std::ops::BitOr;

use crate::catalog::{RelationDef, TableDef};

use super::sql::{column_ref, quote_ident};

/// Which statement parts depend on a join.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JoinUsage(u8);

impl JoinUsage {
    /// Select list.
    pub const PROJECTION: JoinUsage = JoinUsage(1);
    /// WHERE clause.
    pub const FILTER: JoinUsage = JoinUsage(2);
    /// ORDER BY clause.
    pub const SORT: JoinUsage = JoinUsage(4);
    /// Aggregate statement.
    pub const AGGREGATE: JoinUsage = JoinUsage(8);
    /// Everything the row statement renders.
    pub const ROWS: JoinUsage = JoinUsage(1 | 2 | 4);

    /// True when any bit is shared.
    pub fn intersects(self, other: JoinUsage) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for JoinUsage {
    type Output = JoinUsage;

    fn bitor(self, rhs: JoinUsage) -> JoinUsage {
        JoinUsage(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct JunctionHop {
    table: String,
    alias: String,
    source_key: String,
    target_key: String,
}

/// One planned `LEFT JOIN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinDescriptor {
    /// Alias of the table the relation hangs off.
    pub parent_alias: String,
    /// Relation name on the parent table.
    pub relation_name: String,
    /// Alias assigned to the target table.
    pub alias: String,
    /// Dotted relation path from the root.
    pub path: String,
    /// Target table.
    pub target_table: String,
    /// True for to-many relations.
    pub many: bool,
    /// Primary key of the target table.
    pub target_pk: String,
    /// Consumers that need this join.
    pub usage: JoinUsage,
    parent_key: String,
    target_key: String,
    junction: Option<JunctionHop>,
}

impl JoinDescriptor {
    /// Appends ` LEFT JOIN ...` (two joins for junction relations).
    pub fn render(&self, out: &mut String) {
        let parent = column_ref(&self.parent_alias, &self.parent_key);
        match &self.junction {
            Some(link) => {
                out.push_str(&format!(
                    " LEFT JOIN {} AS {} ON {} = {}",
                    quote_ident(&link.table),
                    quote_ident(&link.alias),
                    column_ref(&link.alias, &link.source_key),
                    parent
                ));
                out.push_str(&format!(
                    " LEFT JOIN {} AS {} ON {} = {}",
                    quote_ident(&self.target_table),
                    quote_ident(&self.alias),
                    column_ref(&self.alias, &self.target_key),
                    column_ref(&link.alias, &link.target_key)
                ));
            }
            None => out.push_str(&format!(
                " LEFT JOIN {} AS {} ON {} = {}",
                quote_ident(&self.target_table),
                quote_ident(&self.alias),
                column_ref(&self.alias, &self.target_key),
                parent
            )),
        }
    }
}

/// Path to alias memo plus the ordered join list.
#[derive(Clone, Debug)]
pub struct AliasMap {
    root_alias: String,
    by_path: HashMap<String, usize>,
    joins: Vec<JoinDescriptor>,
    scratch: usize,
    recording: Option<Vec<usize>>,
}

impl AliasMap {
    /// Starts a map for a statement rooted at `root_alias`.
    pub fn new(root_alias: impl Into<String>) -> Self {
        Self {
            root_alias: root_alias.into(),
            by_path: HashMap::new(),
            joins: Vec::new(),
            scratch: 0,
            recording: None,
        }
    }

    /// Alias of the root table.
    pub fn root_alias(&self) -> &str {
        &self.root_alias
    }

    /// Returns the alias for `parent_path.relation`, planning the join on
    /// first sight.
    pub fn join(
        &mut self,
        parent_path: &str,
        parent_alias: &str,
        relation: &RelationDef,
        target: &TableDef,
        usage: JoinUsage,
    ) -> String {
        let path = if parent_path.is_empty() {
            relation.name.clone()
        } else {
            format!("{parent_path}.{}", relation.name)
        };
        if let Some(&idx) = self.by_path.get(&path) {
            self.touch(idx);
            let join = &mut self.joins[idx];
            join.usage = join.usage | usage;
            return join.alias.clone();
        }
        self.touch(self.joins.len());
        let alias = format!("j{}", self.joins.len());
        let junction = relation.junction.as_ref().map(|j| JunctionHop {
            table: j.table.clone(),
            alias: format!("{alias}_link"),
            source_key: j.source_key.clone(),
            target_key: j.target_key.clone(),
        });
        self.by_path.insert(path.clone(), self.joins.len());
        self.joins.push(JoinDescriptor {
            parent_alias: parent_alias.to_string(),
            relation_name: relation.name.clone(),
            alias: alias.clone(),
            path,
            target_table: target.name.clone(),
            many: relation.is_many(),
            target_pk: target.primary_key.clone(),
            usage,
            parent_key: relation.join_key.clone(),
            target_key: relation.inverse_join_key.clone(),
            junction,
        });
        alias
    }

    /// Alias already assigned to a relation path.
    pub fn alias_for(&self, path: &str) -> Option<&str> {
        self.by_path
            .get(path)
            .map(|&idx| self.joins[idx].alias.as_str())
    }

    /// All joins in first-seen order.
    pub fn joins(&self) -> &[JoinDescriptor] {
        &self.joins
    }

    /// Joins needed by any consumer in `usage`.
    pub fn joins_for(&self, usage: JoinUsage) -> impl Iterator<Item = &JoinDescriptor> {
        self.joins.iter().filter(move |j| j.usage.intersects(usage))
    }

    /// True if a to-many join is needed by `usage`.
    pub fn has_many(&self, usage: JoinUsage) -> bool {
        self.joins_for(usage).any(|j| j.many)
    }

    /// Renders the joins needed by `usage`.
    pub fn render(&self, usage: JoinUsage) -> String {
        let mut out = String::new();
        for join in self.joins_for(usage) {
            join.render(&mut out);
        }
        out
    }

    fn touch(&mut self, idx: usize) {
        if let Some(recorded) = &mut self.recording {
            if !recorded.contains(&idx) {
                recorded.push(idx);
            }
        }
    }

    /// Starts collecting the joins reached by subsequent `join` calls,
    /// whether they are planned or reused.
    pub fn start_recording(&mut self) {
        self.recording = Some(Vec::new());
    }

    /// Stops collecting and returns the join indices reached, ascending.
    pub fn take_recorded(&mut self) -> Vec<usize> {
        let mut recorded = self.recording.take().unwrap_or_default();
        recorded.sort_unstable();
        recorded
    }

    /// True if any join in `indices` is to-many.
    pub fn any_many(&self, indices: &[usize]) -> bool {
        indices
            .iter()
            .filter_map(|&idx| self.joins.get(idx))
            .any(|j| j.many)
    }

    /// Renders exactly the joins in `indices`, in plan order.
    pub fn render_indices(&self, indices: &[usize]) -> String {
        let mut out = String::new();
        for (idx, join) in self.joins.iter().enumerate() {
            if indices.contains(&idx) {
                join.render(&mut out);
            }
        }
        out
    }

    /// Fresh alias for a correlated subquery; never memoized.
    pub fn scratch(&mut self) -> String {
        let alias = format!("s{}", self.scratch);
        self.scratch += 1;
        alias
    }
}
