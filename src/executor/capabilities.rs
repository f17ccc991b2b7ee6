//! Host capabilities scripts reach through remote calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::query::FindRequest;
use crate::repository::{DynamicRepository, RepositoryRegistry};
use crate::store::fold_accents;

use super::protocol::{CallError, CallTarget, RepoMethod, ScriptContext};

/// Everything a script may ask the host to do.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Tables exposed under `repos`.
    fn tables(&self) -> Vec<String>;

    /// Helpers exposed under `helpers::`.
    fn helper_names(&self) -> Vec<String>;

    /// Serves one remote call for the execution described by `context`.
    async fn invoke(&self, context: &ScriptContext, path: &str, args: Vec<Json>)
        -> Result<Json, CallError>;
}

/// A synchronous helper function.
pub type Helper = Arc<dyn Fn(&[Json]) -> Result<Json, CallError> + Send + Sync>;

/// Capabilities backed by a [`RepositoryRegistry`] and a helper table.
///
/// Repository calls run on the blocking thread pool so a slow statement never
/// stalls the runtime driving other executions.
#[derive(Clone)]
pub struct HostCapabilities {
    registry: RepositoryRegistry,
    helpers: BTreeMap<String, Helper>,
}

impl HostCapabilities {
    /// Capabilities with the built-in `now` and `slugify` helpers.
    pub fn new(registry: RepositoryRegistry) -> Self {
        let caps = Self {
            registry,
            helpers: BTreeMap::new(),
        };
        caps.with_helper("now", |_| now().map(Json::String))
            .with_helper("slugify", |args| Ok(Json::String(slugify(&text_arg(args, "slugify")?))))
    }

    /// Registers or replaces a helper.
    pub fn with_helper<F>(mut self, name: impl Into<String>, helper: F) -> Self
    where
        F: Fn(&[Json]) -> Result<Json, CallError> + Send + Sync + 'static,
    {
        self.helpers.insert(name.into(), Arc::new(helper));
        self
    }
}

#[async_trait]
impl Capabilities for HostCapabilities {
    fn tables(&self) -> Vec<String> {
        self.registry
            .catalog()
            .tables()
            .map(|table| table.name.clone())
            .collect()
    }

    fn helper_names(&self) -> Vec<String> {
        self.helpers.keys().cloned().collect()
    }

    async fn invoke(
        &self,
        context: &ScriptContext,
        path: &str,
        args: Vec<Json>,
    ) -> Result<Json, CallError> {
        let target = CallTarget::parse(path)
            .ok_or_else(|| CallError::status(400, format!("unknown capability '{path}'")))?;
        match target {
            CallTarget::Throw(status) => Err(CallError::status(status, message_arg(&args))),
            CallTarget::Helper(name) => {
                let helper = self
                    .helpers
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| CallError::status(400, format!("unknown helper '{name}'")))?;
                helper(&args)
            }
            CallTarget::Repo { table, method } => {
                let table = match (table.as_str(), &context.main_table) {
                    ("main", Some(main)) => main.clone(),
                    ("main", None) => {
                        return Err(CallError::status(400, "no main table for this request"))
                    }
                    _ => table,
                };
                let repo = self.registry.repository(&table).map_err(call_error)?;
                tokio::task::spawn_blocking(move || invoke_repo(&repo, method, args))
                    .await
                    .map_err(|err| CallError::internal(format!("repository call aborted: {err}")))?
            }
        }
    }
}

fn invoke_repo(repo: &DynamicRepository, method: RepoMethod, args: Vec<Json>) -> Result<Json, CallError> {
    let arity = match method {
        RepoMethod::Find => 0,
        RepoMethod::Update => 2,
        _ => 1,
    };
    if args.len() < arity {
        return Err(CallError::status(
            400,
            format!(
                "repos.{}.{} expects {arity} argument(s)",
                repo.table(),
                method.name()
            ),
        ));
    }
    let mut args = args.into_iter();
    let mut next = || args.next().unwrap_or(Json::Null);
    match method {
        RepoMethod::Find => {
            let request = match next() {
                Json::Null => FindRequest::default(),
                value => serde_json::from_value(value)
                    .map_err(|err| CallError::status(400, format!("invalid find request: {err}")))?,
            };
            let result = repo.find(&request).map_err(call_error)?;
            serde_json::to_value(result).map_err(|err| CallError::internal(err.to_string()))
        }
        RepoMethod::FindOne => Ok(repo.find_one(&next()).map_err(call_error)?.unwrap_or(Json::Null)),
        RepoMethod::Create => repo.create(&next()).map_err(call_error),
        RepoMethod::Update => {
            let id = next();
            repo.update(&id, &next()).map_err(call_error)
        }
        RepoMethod::Delete => repo.delete(&next()).map(|()| Json::Bool(true)).map_err(call_error),
    }
}

fn call_error(err: crate::Error) -> CallError {
    CallError::status(err.status_code(), err.to_string())
}

fn message_arg(args: &[Json]) -> String {
    match args.first() {
        Some(Json::String(message)) => message.clone(),
        Some(Json::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn text_arg(args: &[Json], helper: &str) -> Result<String, CallError> {
    match args.first() {
        Some(Json::String(text)) => Ok(text.clone()),
        Some(Json::Number(n)) => Ok(n.to_string()),
        _ => Err(CallError::status(400, format!("{helper} expects a string"))),
    }
}

/// Current UTC time in RFC 3339.
pub fn now() -> Result<String, CallError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| CallError::internal(err.to_string()))
}

/// Lowercase, accent-folded, dash-separated form of `text`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in fold_accents(text).chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}
