//! Per-request compilation state: the catalog snapshot, the root table, the
//! alias map, and the unresolved-path policy.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{ColumnDef, RelationDef, SchemaCatalog, TableDef};

use super::alias::{AliasMap, JoinUsage};
use super::ast::FieldPath;
use super::errors::CompileError;

/// What to do with a path that does not resolve against the catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathPolicy {
    /// Drop the predicate, field, or sort term and log a warning.
    #[default]
    Lenient,
    /// Reject the request with [`CompileError::UnresolvedPath`].
    Strict,
}

/// Knobs for a single compilation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CompileOptions {
    /// Unresolved path handling.
    pub path_policy: PathPolicy,
    /// Alias of the root table in generated SQL.
    pub root_alias: String,
    /// Page size when the request omits `limit`.
    pub default_limit: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            path_policy: PathPolicy::Lenient,
            root_alias: "r".to_string(),
            default_limit: 10,
        }
    }
}

impl CompileOptions {
    /// Options with [`PathPolicy::Strict`].
    pub fn strict() -> Self {
        Self {
            path_policy: PathPolicy::Strict,
            ..Self::default()
        }
    }

    /// Replaces the root alias after checking it with [`Self::validate`].
    pub fn with_root_alias(mut self, alias: impl Into<String>) -> Result<Self, CompileError> {
        self.root_alias = alias.into();
        self.validate()?;
        Ok(self)
    }

    /// Rejects a root alias that is empty or could collide with the aliases
    /// the compiler generates (`j<n>`, `j<n>_link`, `s<n>`, `o<n>`, `a<n>`,
    /// `w`, `k`).
    pub fn validate(&self) -> Result<(), CompileError> {
        let alias = self.root_alias.as_str();
        let reject = |reason| {
            Err(CompileError::InvalidRootAlias {
                alias: alias.to_string(),
                reason,
            })
        };
        if alias.is_empty() {
            return reject("must not be empty");
        }
        if matches!(alias, "w" | "k") {
            return reject("reserved for the paging subquery");
        }
        let numbered = |rest: &str| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit());
        let mut chars = alias.chars();
        let generated = match chars.next() {
            Some('j') => {
                let rest = chars.as_str();
                numbered(rest.strip_suffix("_link").unwrap_or(rest))
            }
            Some('s' | 'o' | 'a') => numbered(chars.as_str()),
            _ => false,
        };
        if generated {
            return reject("collides with a generated alias");
        }
        Ok(())
    }
}

/// A relation crossed while resolving a path.
#[derive(Clone, Debug)]
pub(crate) struct Hop<'c> {
    pub path: String,
    pub alias: String,
    pub relation: &'c RelationDef,
    pub target: &'c TableDef,
}

/// Outcome of resolving a path.
#[derive(Clone, Debug)]
pub(crate) enum Resolved<'c> {
    /// Path ends at a scalar column.
    Column {
        hops: Vec<Hop<'c>>,
        alias: String,
        column: &'c ColumnDef,
    },
    /// Path ends at a relation that has not been joined yet.
    Relation {
        hops: Vec<Hop<'c>>,
        parent_path: String,
        parent_alias: String,
        parent: &'c TableDef,
        relation: &'c RelationDef,
        target: &'c TableDef,
    },
}

impl Resolved<'_> {
    /// True if any crossed relation is to-many.
    pub fn through_many(&self) -> bool {
        let hops = match self {
            Resolved::Column { hops, .. } | Resolved::Relation { hops, .. } => hops,
        };
        hops.iter().any(|hop| hop.relation.is_many())
    }
}

enum Step<'c> {
    Relation(&'c RelationDef, &'c TableDef),
    Column(&'c ColumnDef),
}

pub(crate) struct QueryContext<'c> {
    pub catalog: &'c SchemaCatalog,
    pub root: &'c TableDef,
    pub aliases: AliasMap,
    pub options: CompileOptions,
    pub skipped: Vec<String>,
}

impl<'c> QueryContext<'c> {
    pub fn new(
        catalog: &'c SchemaCatalog,
        table: &str,
        options: CompileOptions,
    ) -> Result<Self, CompileError> {
        options.validate()?;
        let root = catalog
            .table(table)
            .ok_or_else(|| CompileError::UnknownTable {
                table: table.to_string(),
            })?;
        Ok(Self {
            catalog,
            root,
            aliases: AliasMap::new(options.root_alias.clone()),
            options,
            skipped: Vec::new(),
        })
    }

    pub fn root_alias(&self) -> String {
        self.aliases.root_alias().to_string()
    }

    /// Walks `path` without planning anything.
    fn walk(&self, path: &FieldPath) -> Option<Vec<Step<'c>>> {
        let segments = path.segments();
        let mut table = self.root;
        let mut steps = Vec::with_capacity(segments.len());
        for (idx, segment) in segments.iter().enumerate() {
            if let Some(relation) = table.relation(segment) {
                let target = self.catalog.target_of(relation)?;
                steps.push(Step::Relation(relation, target));
                table = target;
            } else if let Some(column) = table.column(segment) {
                if idx + 1 != segments.len() {
                    return None;
                }
                steps.push(Step::Column(column));
            } else {
                return None;
            }
        }
        Some(steps)
    }

    /// Resolves `path`, joining every relation except a trailing one.
    pub fn resolve(&mut self, path: &FieldPath, usage: JoinUsage) -> Option<Resolved<'c>> {
        let mut steps = self.walk(path)?;
        let last = steps.pop()?;
        let mut hops = Vec::with_capacity(steps.len());
        let mut table = self.root;
        let mut alias = self.root_alias();
        let mut current = String::new();
        for step in steps {
            let Step::Relation(relation, target) = step else {
                return None;
            };
            alias = self
                .aliases
                .join(&current, &alias, relation, target, usage);
            current = if current.is_empty() {
                relation.name.clone()
            } else {
                format!("{current}.{}", relation.name)
            };
            hops.push(Hop {
                path: current.clone(),
                alias: alias.clone(),
                relation,
                target,
            });
            table = target;
        }
        Some(match last {
            Step::Column(column) => Resolved::Column {
                hops,
                alias,
                column,
            },
            Step::Relation(relation, target) => Resolved::Relation {
                hops,
                parent_path: current,
                parent_alias: alias,
                parent: table,
                relation,
                target,
            },
        })
    }

    /// Plans the join for a trailing relation and returns the resulting hop.
    pub fn join_relation(&mut self, resolved: &Resolved<'c>, usage: JoinUsage) -> Option<Hop<'c>> {
        let Resolved::Relation {
            parent_path,
            parent_alias,
            relation,
            target,
            ..
        } = resolved
        else {
            return None;
        };
        let alias = self
            .aliases
            .join(parent_path, parent_alias, relation, target, usage);
        let path = if parent_path.is_empty() {
            relation.name.clone()
        } else {
            format!("{parent_path}.{}", relation.name)
        };
        Some(Hop {
            path,
            alias,
            relation: *relation,
            target: *target,
        })
    }

    /// Applies the path policy to something that did not resolve.
    pub fn unresolved(&mut self, path: &FieldPath, what: &'static str) -> Result<(), CompileError> {
        match self.options.path_policy {
            PathPolicy::Strict => Err(CompileError::UnresolvedPath {
                table: self.root.name.clone(),
                path: path.to_string(),
            }),
            PathPolicy::Lenient => {
                warn!(
                    table = %self.root.name,
                    path = %path,
                    what,
                    "dropping unresolved path"
                );
                self.skipped.push(path.to_string());
                Ok(())
            }
        }
    }
}
